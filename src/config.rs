/// Process-wide policy knobs, read from the environment exactly once at
/// startup and carried in `AppState`. Handlers never read ambient env state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum notice, in hours, before a class's first upcoming session
    /// within which non-admin cancellation is refused.
    pub cancel_cutoff_hours: i64,
    pub grade_min: f64,
    pub grade_max: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cancel_cutoff_hours: 24,
            grade_min: 0.0,
            grade_max: 10.0,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let defaults = Config::default();
        Config {
            cancel_cutoff_hours: env_parse(
                "ENROLL_CANCEL_CUTOFF_HOURS",
                defaults.cancel_cutoff_hours,
            ),
            grade_min: env_parse("GRADE_MIN", defaults.grade_min),
            grade_max: env_parse("GRADE_MAX", defaults.grade_max),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
