//! 联锁逻辑（Interlocking Engine）：单次扫描。
//!
//! 每个扫描周期按顺序执行：
//! 1. 读模式寄存器与 4 个输入（占用 A/B/C、碰撞）
//! 2. 碰撞：急停置位、三个信号全红，本周期结束（最高优先级，先于模式判断）
//! 3. 否则清急停；B 区占用时道岔强制回正线（覆盖外部命令）
//! 4. 监管模式：不计算信号，只把现有信号值规整为 0/1
//! 5. 自主模式：AB 绿 <=> B 空闲；BC 绿 <=> C 空闲；SB 绿 <=> B 空闲且道岔在正线

use serde::Serialize;

use super::model::{address, bit, Aspect, OperatingMode, Signals, Turnout};
use super::store::{RegisterStore, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ScanInputs {
    pub mode: OperatingMode,
    pub occ_a: bool,
    pub occ_b: bool,
    pub occ_c: bool,
    pub crash: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ScanOutcome {
    CrashStop,
    Supervised { turnout: Turnout },
    Autonomous { turnout: Turnout, signals: Signals },
}

pub fn read_inputs(store: &RegisterStore) -> Result<ScanInputs, StoreError> {
    let mode = OperatingMode::from_register(store.register(address::HR_MODE)?);
    let inputs = store.read_registers(address::HR_IN_OCC_A, 4)?;
    Ok(ScanInputs {
        mode,
        occ_a: bit(inputs[0]) == 1,
        occ_b: bit(inputs[1]) == 1,
        occ_c: bit(inputs[2]) == 1,
        crash: bit(inputs[3]) == 1,
    })
}

/// Signals derived purely from occupancy and turnout (autonomous mode).
pub fn autonomous_signals(inputs: &ScanInputs, turnout: Turnout) -> Signals {
    let proceed_if = |free: bool| if free { Aspect::Proceed } else { Aspect::Stop };
    Signals {
        ab: proceed_if(!inputs.occ_b),
        bc: proceed_if(!inputs.occ_c),
        sb: proceed_if(!inputs.occ_b && turnout == Turnout::Main),
    }
}

pub fn scan_once(store: &RegisterStore) -> Result<ScanOutcome, StoreError> {
    let inputs = read_inputs(store)?;

    if inputs.crash {
        store.set_coil(address::CO_ESTOP, true)?;
        store.write_registers(address::HR_SIG_AB, &Signals::ALL_STOP.to_registers())?;
        return Ok(ScanOutcome::CrashStop);
    }

    store.set_coil(address::CO_ESTOP, false)?;

    let mut turnout = Turnout::from_coil(store.coil(address::CO_TURNOUT_MAIN)?);
    if inputs.occ_b {
        turnout = Turnout::Main;
        store.set_coil(address::CO_TURNOUT_MAIN, true)?;
    }

    if inputs.mode == OperatingMode::Supervised {
        let current = store.read_registers(address::HR_SIG_AB, 3)?;
        let clamped: Vec<u16> = current.iter().map(|v| bit(*v)).collect();
        store.write_registers(address::HR_SIG_AB, &clamped)?;
        return Ok(ScanOutcome::Supervised { turnout });
    }

    let signals = autonomous_signals(&inputs, turnout);
    store.write_registers(address::HR_SIG_AB, &signals.to_registers())?;
    Ok(ScanOutcome::Autonomous { turnout, signals })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(mode: u16, occ: [u16; 3], crash: u16, turnout_main: bool) -> RegisterStore {
        let store = RegisterStore::with_defaults(200, 300).unwrap();
        store.set_register(address::HR_MODE, mode).unwrap();
        store
            .write_registers(address::HR_IN_OCC_A, &[occ[0], occ[1], occ[2], crash])
            .unwrap();
        store
            .set_coil(address::CO_TURNOUT_MAIN, turnout_main)
            .unwrap();
        store
    }

    fn signals(store: &RegisterStore) -> Vec<u16> {
        store.read_registers(address::HR_SIG_AB, 3).unwrap()
    }

    #[test]
    fn crash_forces_estop_and_all_red_regardless_of_mode() {
        for mode in [0, 1] {
            let store = store_with(mode, [0, 0, 0], 1, true);
            store.write_registers(address::HR_SIG_AB, &[1, 1, 1]).unwrap();

            assert_eq!(scan_once(&store).unwrap(), ScanOutcome::CrashStop);
            assert!(store.coil(address::CO_ESTOP).unwrap());
            assert_eq!(signals(&store), vec![0, 0, 0]);
        }
    }

    #[test]
    fn autonomous_signals_follow_occupancy_truth_table() {
        for occ_b in [0u16, 1] {
            for occ_c in [0u16, 1] {
                for turnout_main in [false, true] {
                    let store = store_with(0, [0, occ_b, occ_c], 0, turnout_main);
                    scan_once(&store).unwrap();

                    let effective_main = turnout_main || occ_b == 1;
                    let expected = vec![
                        u16::from(occ_b == 0),
                        u16::from(occ_c == 0),
                        u16::from(occ_b == 0 && effective_main),
                    ];
                    assert_eq!(
                        signals(&store),
                        expected,
                        "occB={occ_b} occC={occ_c} turnoutMain={turnout_main}"
                    );
                    assert!(!store.coil(address::CO_ESTOP).unwrap());
                }
            }
        }
    }

    #[test]
    fn occupied_junction_forces_turnout_to_main() {
        for mode in [0, 1] {
            let store = store_with(mode, [0, 1, 0], 0, false);
            scan_once(&store).unwrap();
            assert!(store.coil(address::CO_TURNOUT_MAIN).unwrap());
        }

        let store = store_with(0, [0, 0, 0], 0, false);
        scan_once(&store).unwrap();
        assert!(!store.coil(address::CO_TURNOUT_MAIN).unwrap());
        assert_eq!(signals(&store), vec![1, 1, 0]);
    }

    #[test]
    fn supervised_mode_keeps_external_signals_across_cycles() {
        let store = store_with(1, [0, 0, 0], 0, true);
        store.write_registers(address::HR_SIG_AB, &[0, 1, 0]).unwrap();

        for _ in 0..5 {
            let outcome = scan_once(&store).unwrap();
            assert_eq!(
                outcome,
                ScanOutcome::Supervised {
                    turnout: Turnout::Main
                }
            );
            assert_eq!(signals(&store), vec![0, 1, 0]);
        }
    }

    #[test]
    fn supervised_mode_clamps_out_of_band_values() {
        let store = store_with(1, [0, 0, 0], 0, true);
        store.write_registers(address::HR_SIG_AB, &[7, 0, 0x8000]).unwrap();

        scan_once(&store).unwrap();
        assert_eq!(signals(&store), vec![1, 0, 1]);
    }

    #[test]
    fn crash_clear_releases_estop_on_next_cycle() {
        let store = store_with(0, [0, 0, 0], 1, true);
        scan_once(&store).unwrap();
        assert!(store.coil(address::CO_ESTOP).unwrap());

        store.set_register(address::HR_IN_CRASH, 0).unwrap();
        scan_once(&store).unwrap();
        assert!(!store.coil(address::CO_ESTOP).unwrap());
        assert_eq!(signals(&store), vec![1, 1, 1]);
    }

    #[test]
    fn undersized_store_fails_the_scan_instead_of_panicking() {
        let store = RegisterStore::new(2, 60);
        assert!(matches!(
            scan_once(&store),
            Err(StoreError::OutOfRange { .. })
        ));
    }
}
