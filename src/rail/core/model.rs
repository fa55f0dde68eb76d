//! 铁路实验台：寄存器地址表、领域枚举与配置 DTO。
//!
//! 约束：
//! - 地址表必须与现有 SCADA/攻击脚本保持逐位兼容（coil 0/1，HR 0..2 / 50 / 100..103 / 110..113）
//! - 信号只有两态：0 = 停车（红），1 = 允许（绿）
//! - 配置 JSON 顶层必须包含 `schemaVersion: 1`

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION_V1: u32 = 1;

/// Fixed coil / holding register assignments.
pub mod address {
    /// 1 = main line, 0 = siding.
    pub const CO_TURNOUT_MAIN: u16 = 0;
    /// 1 = stop all movement.
    pub const CO_ESTOP: u16 = 1;

    pub const HR_SIG_AB: u16 = 0;
    pub const HR_SIG_BC: u16 = 1;
    pub const HR_SIG_SB: u16 = 2;

    /// 0 = autonomous, 1 = externally supervised.
    pub const HR_MODE: u16 = 50;

    pub const HR_IN_OCC_A: u16 = 100;
    pub const HR_IN_OCC_B: u16 = 101;
    pub const HR_IN_OCC_C: u16 = 102;
    pub const HR_IN_CRASH: u16 = 103;

    /// 110..113 => A, B, C, siding.
    pub const HR_OVR_OCC_BASE: u16 = 110;
}

pub const DEFAULT_COIL_CAPACITY: u16 = 200;
pub const DEFAULT_REGISTER_CAPACITY: u16 = 300;

/// Any non-zero register value counts as 1.
pub fn bit(value: u16) -> u16 {
    if value != 0 {
        1
    } else {
        0
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Aspect {
    #[default]
    Stop,
    Proceed,
}

impl Aspect {
    pub fn from_register(value: u16) -> Self {
        if value & 1 == 1 {
            Aspect::Proceed
        } else {
            Aspect::Stop
        }
    }

    pub fn to_register(self) -> u16 {
        match self {
            Aspect::Stop => 0,
            Aspect::Proceed => 1,
        }
    }

    pub fn is_proceed(self) -> bool {
        self == Aspect::Proceed
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Turnout {
    #[default]
    Main,
    Siding,
}

impl Turnout {
    pub fn from_coil(value: bool) -> Self {
        if value {
            Turnout::Main
        } else {
            Turnout::Siding
        }
    }

    pub fn to_coil(self) -> bool {
        self == Turnout::Main
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    Autonomous,
    Supervised,
}

impl OperatingMode {
    pub fn from_register(value: u16) -> Self {
        if bit(value) == 1 {
            OperatingMode::Supervised
        } else {
            OperatingMode::Autonomous
        }
    }

    pub fn to_register(self) -> u16 {
        match self {
            OperatingMode::Autonomous => 0,
            OperatingMode::Supervised => 1,
        }
    }
}

/// Commanded aspects for the three governed segments.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Signals {
    pub ab: Aspect,
    pub bc: Aspect,
    pub sb: Aspect,
}

impl Signals {
    pub const ALL_STOP: Signals = Signals {
        ab: Aspect::Stop,
        bc: Aspect::Stop,
        sb: Aspect::Stop,
    };

    pub fn new(ab: Aspect, bc: Aspect, sb: Aspect) -> Self {
        Self { ab, bc, sb }
    }

    pub fn from_registers(registers: &[u16]) -> Option<Self> {
        match registers {
            [ab, bc, sb, ..] => Some(Self {
                ab: Aspect::from_register(*ab),
                bc: Aspect::from_register(*bc),
                sb: Aspect::from_register(*sb),
            }),
            _ => None,
        }
    }

    pub fn to_registers(self) -> [u16; 3] {
        [
            self.ab.to_register(),
            self.bc.to_register(),
            self.sb.to_register(),
        ]
    }
}

/// Occupancy bits for A, B, C and the siding (S).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Occupancy {
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub siding: bool,
}

impl Occupancy {
    pub fn from_registers(registers: &[u16]) -> Option<Self> {
        match registers {
            [a, b, c, s, ..] => Some(Self {
                a: a & 1 == 1,
                b: b & 1 == 1,
                c: c & 1 == 1,
                siding: s & 1 == 1,
            }),
            _ => None,
        }
    }

    /// HR 100..103 payload: A, B, C and the crash flag.
    pub fn to_input_registers(self, crash: bool) -> [u16; 4] {
        [
            u16::from(self.a),
            u16::from(self.b),
            u16::from(self.c),
            u16::from(crash),
        ]
    }
}

fn default_plc_bind_addr() -> String {
    "0.0.0.0:5020".to_string()
}

fn default_plc_addr() -> String {
    "127.0.0.1:5020".to_string()
}

fn default_gateway_listen_addr() -> String {
    "0.0.0.0:5021".to_string()
}

fn default_telemetry_addr() -> Option<String> {
    Some("127.0.0.1:9999".to_string())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlcConfig {
    pub bind_addr: String,
    pub unit_id: u8,
    pub scan_interval_ms: u64,
    pub status_interval_ms: u64,
    pub coil_capacity: u16,
    pub register_capacity: u16,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_plc_bind_addr(),
            unit_id: 1,
            scan_interval_ms: 100,
            status_interval_ms: 1000,
            coil_capacity: DEFAULT_COIL_CAPACITY,
            register_capacity: DEFAULT_REGISTER_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    pub plc_addr: String,
    pub unit_id: u8,
    pub tick_hz: u32,
    pub poll_interval_ms: u64,
    pub blackout_ms: u64,
    pub publish_hold_ms: u64,
    pub headway_ms: u64,
    pub move_duration_ms: u64,
    pub crash_duration_ms: u64,
    pub request_timeout_ms: u64,
    /// `None` 表示不发送遥测。
    pub telemetry_addr: Option<String>,
    pub telemetry_hz: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            plc_addr: default_plc_addr(),
            unit_id: 1,
            tick_hz: 60,
            poll_interval_ms: 100,
            blackout_ms: 3000,
            publish_hold_ms: 500,
            headway_ms: 1200,
            move_duration_ms: 1600,
            crash_duration_ms: 1200,
            request_timeout_ms: 500,
            telemetry_addr: default_telemetry_addr(),
            telemetry_hz: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub unit_id: u8,
    /// Holding register forced by the rewrite rule and targeted by injections.
    pub protected_register: u16,
    pub forced_value: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_gateway_listen_addr(),
            upstream_addr: default_plc_addr(),
            unit_id: 1,
            protected_register: address::HR_SIG_BC,
            forced_value: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabConfigV1 {
    pub schema_version: u32,
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for LabConfigV1 {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1,
            plc: PlcConfig::default(),
            simulator: SimulatorConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_config_json_uses_camel_case_and_fills_missing_sections() {
        let json = r#"{ "schemaVersion": 1, "gateway": { "protectedRegister": 2 } }"#;
        let config: LabConfigV1 = serde_json::from_str(json).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION_V1);
        assert_eq!(config.plc, PlcConfig::default());
        assert_eq!(config.simulator.blackout_ms, 3000);
        assert_eq!(config.gateway.protected_register, 2);
        assert_eq!(config.gateway.forced_value, 1);

        let text = serde_json::to_string_pretty(&LabConfigV1::default()).unwrap();
        assert!(text.contains("\"scanIntervalMs\": 100"));
        assert!(text.contains("\"publishHoldMs\": 500"));
        assert!(!text.contains("scan_interval_ms"));
    }

    #[test]
    fn signals_and_occupancy_map_to_register_layout() {
        let signals = Signals::from_registers(&[0, 1, 7]).unwrap();
        assert_eq!(
            signals,
            Signals::new(Aspect::Stop, Aspect::Proceed, Aspect::Proceed)
        );
        assert_eq!(signals.to_registers(), [0, 1, 1]);
        assert!(Signals::from_registers(&[1, 1]).is_none());

        let occupancy = Occupancy::from_registers(&[1, 0, 1, 1]).unwrap();
        assert!(occupancy.a && !occupancy.b && occupancy.c && occupancy.siding);
        assert_eq!(occupancy.to_input_registers(false), [1, 0, 1, 0]);
        assert_eq!(occupancy.to_input_registers(true)[3], 1);
    }

    #[test]
    fn mode_register_is_clamped_to_two_states() {
        assert_eq!(OperatingMode::from_register(0), OperatingMode::Autonomous);
        assert_eq!(OperatingMode::from_register(1), OperatingMode::Supervised);
        assert_eq!(OperatingMode::from_register(42), OperatingMode::Supervised);
        assert_eq!(Turnout::from_coil(true), Turnout::Main);
        assert!(!Turnout::Siding.to_coil());
    }
}
