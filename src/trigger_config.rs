use crate::channel_config::{Channel, VoltageRange};

/// Default threshold used by [`SimpleTrigger::rising_edge`], in ADC counts.
pub const DEFAULT_THRESHOLD_ADC: i16 = 1024;
/// Default auto-trigger timeout in milliseconds.
pub const DEFAULT_AUTO_TRIGGER_MS: i16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDirection {
    Rising,
    Falling,
}

impl ThresholdDirection {
    pub fn code(self) -> i16 {
        match self {
            ThresholdDirection::Rising => 0,
            ThresholdDirection::Falling => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Channel(Channel),
    /// Trigger disabled; the block run starts immediately.
    None,
}

impl TriggerSource {
    pub fn code(self) -> i16 {
        match self {
            TriggerSource::Channel(channel) => channel.code(),
            TriggerSource::None => 5,
        }
    }
}

/// Arguments of `ps2000_set_trigger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleTrigger {
    pub source: TriggerSource,
    pub threshold_adc: i16,
    pub direction: ThresholdDirection,
    /// Trigger position in percent of the block, -100..=100.
    pub delay_percent: i16,
    /// 0 waits for the trigger forever.
    pub auto_trigger_ms: i16,
}

impl SimpleTrigger {
    /// Rising edge on `channel` at [`DEFAULT_THRESHOLD_ADC`], auto-triggering after
    /// [`DEFAULT_AUTO_TRIGGER_MS`].
    pub fn rising_edge(channel: Channel) -> Self {
        Self {
            source: TriggerSource::Channel(channel),
            threshold_adc: DEFAULT_THRESHOLD_ADC,
            direction: ThresholdDirection::Rising,
            delay_percent: 0,
            auto_trigger_ms: DEFAULT_AUTO_TRIGGER_MS,
        }
    }

    pub fn disabled() -> Self {
        Self {
            source: TriggerSource::None,
            threshold_adc: 0,
            direction: ThresholdDirection::Rising,
            delay_percent: 0,
            auto_trigger_ms: 0,
        }
    }

    pub fn start_capturing_when(channel: Channel) -> SimpleTriggerBuilder {
        SimpleTriggerBuilder {
            trigger: Self::rising_edge(channel),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTriggerBuilder {
    trigger: SimpleTrigger,
}

impl SimpleTriggerBuilder {
    pub fn rises_above_adc(mut self, threshold_adc: i16) -> Self {
        self.trigger.direction = ThresholdDirection::Rising;
        self.trigger.threshold_adc = threshold_adc;
        self
    }

    pub fn falls_below_adc(mut self, threshold_adc: i16) -> Self {
        self.trigger.direction = ThresholdDirection::Falling;
        self.trigger.threshold_adc = threshold_adc;
        self
    }

    /// Like [`Self::rises_above_adc`], with the level given in millivolts for `range`.
    pub fn rises_above_mv(self, mv: f64, range: VoltageRange) -> Self {
        self.rises_above_adc(range.mv_to_adc(mv))
    }

    pub fn falls_below_mv(self, mv: f64, range: VoltageRange) -> Self {
        self.falls_below_adc(range.mv_to_adc(mv))
    }

    pub fn delay_percent(mut self, percent: i16) -> Self {
        self.trigger.delay_percent = percent.clamp(-100, 100);
        self
    }

    pub fn auto_trigger_after_ms(mut self, ms: i16) -> Self {
        self.trigger.auto_trigger_ms = ms.max(0);
        self
    }

    pub fn build(self) -> SimpleTrigger {
        self.trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rising_edge() {
        let trigger = SimpleTrigger::rising_edge(Channel::A);
        assert_eq!(trigger.source.code(), 0);
        assert_eq!(trigger.threshold_adc, 1024);
        assert_eq!(trigger.direction.code(), 0);
        assert_eq!(trigger.delay_percent, 0);
        assert_eq!(trigger.auto_trigger_ms, 1000);
    }

    #[test]
    fn test_builder() {
        let trigger = SimpleTrigger::start_capturing_when(Channel::B)
            .falls_below_mv(-250.0, VoltageRange::V1)
            .delay_percent(-150)
            .auto_trigger_after_ms(-5)
            .build();
        assert_eq!(trigger.source, TriggerSource::Channel(Channel::B));
        assert_eq!(trigger.direction, ThresholdDirection::Falling);
        assert_eq!(trigger.threshold_adc, VoltageRange::V1.mv_to_adc(-250.0));
        assert_eq!(trigger.delay_percent, -100);
        assert_eq!(trigger.auto_trigger_ms, 0);
    }

    #[test]
    fn test_disabled_trigger_source() {
        assert_eq!(SimpleTrigger::disabled().source.code(), 5);
    }
}
