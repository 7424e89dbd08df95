//! Visual meter state and rendering
//!
//! Pure consumer of the session status: nothing here feeds back into the
//! audio pipeline.

/// Inputs the meter renders from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterState {
    /// Session is connected
    pub is_active: bool,
    /// Microphone volume (0..=255)
    pub volume: u8,
    /// Model speech is playing
    pub is_agent_talking: bool,
}

/// Which signal is driving the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Agent speech playing
    Speaking,
    /// Microphone picking up the user
    Listening,
    /// Nothing happening
    Idle,
}

/// Ring drawn by the meter for one animation frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ring {
    /// Inner ring radius
    pub radius: f64,
    /// Colour selector
    pub tone: Tone,
}

/// Radius of the ring at rest
pub const BASE_RADIUS: f64 = 40.0;

/// Microphone volume below which the meter shows idle
const VOLUME_FLOOR: u8 = 10;

/// Compute the ring for `state` at `elapsed_ms` into the animation
#[must_use]
pub fn ring(state: MeterState, elapsed_ms: f64) -> Ring {
    let (pulse, tone) = if state.is_agent_talking {
        ((elapsed_ms / 150.0).sin().mul_add(20.0, 20.0), Tone::Speaking)
    } else if state.is_active && state.volume > VOLUME_FLOOR {
        (f64::from(state.volume) / 255.0 * 50.0, Tone::Listening)
    } else {
        ((elapsed_ms / 1000.0).sin() * 5.0, Tone::Idle)
    };

    Ring {
        radius: BASE_RADIUS + pulse,
        tone,
    }
}

/// Render a single-line terminal meter `width` cells wide
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn render_bar(state: MeterState, width: usize) -> String {
    let (label, filled) = if state.is_agent_talking {
        ("speaking ", width)
    } else if state.is_active {
        let filled = (f64::from(state.volume) / 255.0 * width as f64).round() as usize;
        ("listening", filled.min(width))
    } else {
        ("idle     ", 0)
    };

    let glyph = if state.is_agent_talking { "▓" } else { "█" };
    format!(
        "{label} [{}{}] {:>3}",
        glyph.repeat(filled),
        " ".repeat(width - filled),
        state.volume
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_talking_wins() {
        let state = MeterState {
            is_active: true,
            volume: 200,
            is_agent_talking: true,
        };
        let r = ring(state, 0.0);
        assert_eq!(r.tone, Tone::Speaking);
        assert!((r.radius - 60.0).abs() < 1e-9);
    }

    #[test]
    fn microphone_volume_drives_listening_ring() {
        let state = MeterState {
            is_active: true,
            volume: 255,
            is_agent_talking: false,
        };
        let r = ring(state, 1234.0);
        assert_eq!(r.tone, Tone::Listening);
        assert!((r.radius - 90.0).abs() < 1e-9);
    }

    #[test]
    fn quiet_or_inactive_is_idle() {
        let quiet = MeterState {
            is_active: true,
            volume: 10,
            is_agent_talking: false,
        };
        assert_eq!(ring(quiet, 0.0).tone, Tone::Idle);

        let inactive = MeterState {
            is_active: false,
            volume: 200,
            is_agent_talking: false,
        };
        let r = ring(inactive, 0.0);
        assert_eq!(r.tone, Tone::Idle);
        assert!((r.radius - BASE_RADIUS).abs() < 1e-9);
    }

    #[test]
    fn bar_fills_with_volume() {
        let state = MeterState {
            is_active: true,
            volume: 255,
            is_agent_talking: false,
        };
        let bar = render_bar(state, 10);
        assert!(bar.starts_with("listening"));
        assert_eq!(bar.matches('█').count(), 10);

        let idle = render_bar(MeterState::default(), 10);
        assert!(idle.starts_with("idle"));
        assert_eq!(idle.matches('█').count(), 0);
    }
}
