/// Cranelift optimization level used for every module the runtime or the
/// exporter builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    pub(crate) fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Floating point semantics of the IR optimizer.
///
/// `Fast` allows algebraic simplifications that are not IEEE exact
/// (`x + 0 -> x`, `x * 0 -> 0`). NaN and signed zero behaviour is unspecified
/// in that mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatMode {
    Strict,
    #[default]
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeConfig {
    pub sample_rate: f32,
    pub opt_level: OptLevel,
    pub float_mode: FloatMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(44100.0)
    }
}

impl RuntimeConfig {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            opt_level: OptLevel::default(),
            float_mode: FloatMode::default(),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn with_float_mode(mut self, float_mode: FloatMode) -> Self {
        self.float_mode = float_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.sample_rate, 44100.0);
        assert_eq!(config.opt_level, OptLevel::Speed);
        assert_eq!(config.float_mode, FloatMode::Fast);
    }

    #[test]
    fn setters_chain() {
        let config = RuntimeConfig::default()
            .with_sample_rate(48000.0)
            .with_opt_level(OptLevel::None)
            .with_float_mode(FloatMode::Strict);
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.opt_level.as_setting(), "none");
        assert_eq!(config.float_mode, FloatMode::Strict);
    }
}
