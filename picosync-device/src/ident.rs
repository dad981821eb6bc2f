//! Board identification from USB vendor/product ids.

use picosync_core::PicoModel;

pub const RASPBERRY_PI_VID: u16 = 0x2e8a;

/// Product ids that pin down the chip.
const KNOWN_PIDS: &[(u16, PicoModel)] = &[
    (0x0003, PicoModel::Pico),  // RP2040 boot ROM
    (0x000a, PicoModel::Pico),  // RP2040 SDK stdio
    (0x000f, PicoModel::Pico2), // RP2350 boot ROM
    (0x0009, PicoModel::Pico2), // RP2350 SDK stdio
];

/// Classify a listed serial device.
///
/// Returns `None` for non-Raspberry Pi hardware. MicroPython (pid `0x0005`)
/// uses one product id for every board, so the model falls back to the
/// description text and may stay [`PicoModel::Unknown`].
pub fn classify(vid: Option<u16>, pid: Option<u16>, description: &str) -> Option<PicoModel> {
    match vid {
        Some(RASPBERRY_PI_VID) => {
            let by_pid = pid.and_then(|pid| {
                KNOWN_PIDS
                    .iter()
                    .find(|(known, _)| *known == pid)
                    .map(|(_, model)| *model)
            });
            Some(by_pid.unwrap_or_else(|| model_from_description(description)))
        }
        Some(_) => None,
        None => {
            let lower = description.to_ascii_lowercase();
            if lower.contains("pico") || lower.contains("rp2040") || lower.contains("rp2350") {
                Some(model_from_description(description))
            } else {
                None
            }
        }
    }
}

fn model_from_description(description: &str) -> PicoModel {
    match PicoModel::from_chip_text(description) {
        PicoModel::Unknown => {
            let lower = description.to_ascii_lowercase();
            if lower.contains("pico 2") || lower.contains("pico2") {
                PicoModel::Pico2
            } else {
                PicoModel::Unknown
            }
        }
        model => model,
    }
}
