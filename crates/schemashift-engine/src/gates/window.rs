use chrono::{DateTime, Utc};
use schemashift_core::errors::GateFailure;
use schemashift_core::strategy::MaintenanceWindow;

/// How the maintenance-window gate let a run through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// The strategy has no window.
    NoWindow,
    Inside,
    /// Outside the window, but policy allows override.
    Overridden,
}

/// Check `now` against the window. Outside the window is a gate failure
/// unless the window allows override.
pub fn evaluate_window(
    window: Option<&MaintenanceWindow>,
    now: DateTime<Utc>,
) -> Result<WindowDecision, GateFailure> {
    let Some(window) = window else {
        return Ok(WindowDecision::NoWindow);
    };
    if window.contains(now) {
        return Ok(WindowDecision::Inside);
    }
    if window.override_allowed() {
        return Ok(WindowDecision::Overridden);
    }
    Err(GateFailure::OutsideWindow {
        window: window.to_string(),
        now: window.local_time(now).format("%H:%M").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use std::time::Duration;

    fn window(override_allowed: bool) -> MaintenanceWindow {
        MaintenanceWindow::new(
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            "UTC",
            override_allowed,
            Duration::ZERO,
        )
        .unwrap()
    }

    #[test]
    fn no_window_always_passes() {
        let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap();
        assert_eq!(evaluate_window(None, noon).unwrap(), WindowDecision::NoWindow);
    }

    #[test]
    fn outside_without_override_fails() {
        let noon = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap();
        let err = evaluate_window(Some(&window(false)), noon).unwrap_err();
        assert!(err.to_string().contains("02:00-04:00"));
        assert_eq!(
            evaluate_window(Some(&window(true)), noon).unwrap(),
            WindowDecision::Overridden
        );
    }

    #[test]
    fn inside_passes() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 3, 15, 0).unwrap();
        assert_eq!(
            evaluate_window(Some(&window(false)), t).unwrap(),
            WindowDecision::Inside
        );
    }
}
