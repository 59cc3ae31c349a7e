use crate::window::EntityId;

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Below this the badge shades from green to yellow.
pub const LOW_THRESHOLD_BPS: u64 = 50 * 1024;
/// Above this the badge is solid red.
pub const HIGH_THRESHOLD_BPS: u64 = 1024 * 1024;

/// What the toolbar badge should show for the focused tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badge {
    pub entity_id: EntityId,
    pub text: String,
    pub color: [u8; 3],
}

impl Badge {
    pub fn for_speed(entity_id: EntityId, bytes_per_sec: u64) -> Self {
        Self { entity_id, text: format_rate(bytes_per_sec), color: speed_color(bytes_per_sec) }
    }
}

/// Human-readable size at 1024 granularity, one decimal place.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

pub fn format_rate(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Green → yellow up to the low threshold, yellow → red up to the high one.
pub fn speed_color(bytes_per_sec: u64) -> [u8; 3] {
    if bytes_per_sec <= LOW_THRESHOLD_BPS {
        let ratio = bytes_per_sec as f64 / LOW_THRESHOLD_BPS as f64;
        [(255.0 * ratio).floor() as u8, 255, 0]
    } else if bytes_per_sec <= HIGH_THRESHOLD_BPS {
        let ratio = (bytes_per_sec - LOW_THRESHOLD_BPS) as f64 / (HIGH_THRESHOLD_BPS - LOW_THRESHOLD_BPS) as f64;
        [255, (255.0 * (1.0 - ratio)).floor() as u8, 0]
    } else {
        [255, 0, 0]
    }
}

/// Outbound badge channel. Best effort: implementations swallow their own
/// failures.
pub trait BadgeSink: Send {
    fn set_badge(&mut self, badge: &Badge);
}
