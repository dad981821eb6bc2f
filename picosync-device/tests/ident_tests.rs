//! Parameterised board identification tests for `picosync-device`.

use picosync_core::PicoModel;
use picosync_device::{ident::classify, mpremote::parse_device_list};
use rstest::rstest;

// ---------------------------------------------------------------------------
// Vendor / product ids
// ---------------------------------------------------------------------------

#[rstest]
#[case(0x0003, "", PicoModel::Pico)]
#[case(0x000a, "Raspberry Pi Pico", PicoModel::Pico)]
#[case(0x000f, "", PicoModel::Pico2)]
#[case(0x0009, "Raspberry Pi Pico 2", PicoModel::Pico2)]
#[case(0x0005, "MicroPython Board in FS mode", PicoModel::Unknown)]
#[case(0x0005, "MicroPython Pico 2 with RP2350", PicoModel::Pico2)]
#[case(0x0005, "MicroPython Raspberry Pi Pico with RP2040", PicoModel::Pico)]
fn raspberry_pi_vendor(#[case] pid: u16, #[case] description: &str, #[case] expected: PicoModel) {
    assert_eq!(classify(Some(0x2e8a), Some(pid), description), Some(expected));
}

#[rstest]
#[case(Some(0x10c4), Some(0xea60), "CP2102 USB to UART Bridge")]
#[case(Some(0x0403), Some(0x6001), "FT232R Pico-ish clone")]
#[case(None, None, "ttyS0")]
fn foreign_hardware_is_not_a_pico(
    #[case] vid: Option<u16>,
    #[case] pid: Option<u16>,
    #[case] description: &str,
) {
    assert_eq!(classify(vid, pid, description), None);
}

#[test]
fn missing_ids_fall_back_to_description() {
    assert_eq!(
        classify(None, None, "Board CDC (Raspberry Pi Pico)"),
        Some(PicoModel::Unknown)
    );
    assert_eq!(classify(None, None, "Pico2 serial"), Some(PicoModel::Pico2));
}

// ---------------------------------------------------------------------------
// Listing → model
// ---------------------------------------------------------------------------

#[test]
fn listing_with_mixed_devices() {
    let out = "\
/dev/ttyUSB0 0001 10c4:ea60 Silicon Labs CP2102 USB to UART Bridge Controller
/dev/ttyACM0 de6478b4 2e8a:000a Raspberry Pi Pico
COM7 None 2e8a:0009 Raspberry Pi Pico 2
";
    let models: Vec<_> = parse_device_list(out)
        .iter()
        .map(|d| (d.port.clone(), d.pico_model()))
        .collect();
    assert_eq!(
        models,
        vec![
            ("/dev/ttyUSB0".to_string(), None),
            ("/dev/ttyACM0".to_string(), Some(PicoModel::Pico)),
            ("COM7".to_string(), Some(PicoModel::Pico2)),
        ]
    );
}
