use std::fmt::Display;

use super::Direction;

pub fn open_error_message(backend: &str, direction: Direction, device: &str, err: impl Display) -> String {
    format!("Failed to open {backend} {direction} '{device}': {err}")
}

pub fn config_error_message(direction: Direction, step: &str, err: impl Display) -> String {
    format!("{direction} {step} failed: {err}")
}
