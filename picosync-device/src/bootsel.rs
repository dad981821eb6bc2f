//! Detection of boards held in BOOTSEL mode.
//!
//! In BOOTSEL the board enumerates as a mass-storage volume (`RPI-RP2`,
//! `RP2350`) whose root holds `INFO_UF2.TXT`. Flashing is out of scope; the
//! engine only reports the volume and the chip named in that file.

use std::fs;
use std::path::{Path, PathBuf};

use picosync_core::PicoModel;
use serde::Serialize;

pub const INFO_FILE: &str = "INFO_UF2.TXT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootselVolume {
    pub path: PathBuf,
    pub model: PicoModel,
}

/// Mount roots scanned by default for the current platform.
pub fn default_mount_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        ('D'..='Z').map(|letter| PathBuf::from(format!("{letter}:\\"))).collect()
    } else {
        ["/media", "/run/media", "/mnt", "/Volumes"]
            .iter()
            .map(PathBuf::from)
            .collect()
    }
}

/// Find the first BOOTSEL volume under `roots`.
///
/// A root may itself be the volume (Windows drive letters) or hold volumes one
/// or two levels down (`/Volumes/RPI-RP2`, `/media/<user>/RPI-RP2`).
pub fn find_volume(roots: &[PathBuf]) -> Option<BootselVolume> {
    roots.iter().find_map(|root| {
        if is_volume(root) {
            return Some(volume_at(root));
        }
        subdirs(root).into_iter().find_map(|dir| {
            if is_volume(&dir) {
                Some(volume_at(&dir))
            } else {
                subdirs(&dir)
                    .into_iter()
                    .find(|nested| is_volume(nested))
                    .map(|nested| volume_at(&nested))
            }
        })
    })
}

/// Chip model named in `INFO_UF2.TXT` (`Board-ID: RPI-RP2` / `RP2350`).
pub fn read_model(volume: &Path) -> PicoModel {
    match fs::read_to_string(volume.join(INFO_FILE)) {
        Ok(info) => {
            let model = PicoModel::from_chip_text(&info);
            if model == PicoModel::Unknown && info.contains("RPI-RP2") {
                PicoModel::Pico
            } else {
                model
            }
        }
        Err(_) => PicoModel::Unknown,
    }
}

fn is_volume(dir: &Path) -> bool {
    dir.join(INFO_FILE).is_file()
}

fn volume_at(dir: &Path) -> BootselVolume {
    BootselVolume {
        path: dir.to_path_buf(),
        model: read_model(dir),
    }
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}
