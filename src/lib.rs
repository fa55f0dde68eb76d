//! Railway OT lab: a Modbus TCP "PLC" with an interlocking scan loop, a yard
//! automaton that talks to it over the wire, and an on-path gateway that can
//! rewrite or inject register writes.

pub mod rail;
