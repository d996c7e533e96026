use crate::config::DispatchConfig;
use crate::event::AnchorEvent;

/// What to do with an event whose delivery just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryDecision {
    /// Leave it unacknowledged so the transport redelivers it
    Retry,
    /// Stop retrying and move it out of the channel
    DeadLetter,
}

/// Decides between another attempt and giving up.
pub trait RedeliveryPolicy: Send + Sync {
    /// `failures` counts failed deliveries of this event, including the one
    /// that just happened.
    fn on_failure(&self, event: &AnchorEvent, failures: u32) -> RedeliveryDecision;
}

/// Retry forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedRedelivery;

impl RedeliveryPolicy for UnboundedRedelivery {
    fn on_failure(&self, _event: &AnchorEvent, _failures: u32) -> RedeliveryDecision {
        RedeliveryDecision::Retry
    }
}

/// Give up after `max_attempts` failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct DeadLetterPolicy {
    max_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RedeliveryPolicy for DeadLetterPolicy {
    fn on_failure(&self, _event: &AnchorEvent, failures: u32) -> RedeliveryDecision {
        if failures >= self.max_attempts {
            RedeliveryDecision::DeadLetter
        } else {
            RedeliveryDecision::Retry
        }
    }
}

/// Policy described by `dispatch.max_attempts` (0 = unbounded).
pub fn policy_from_config(config: &DispatchConfig) -> Box<dyn RedeliveryPolicy> {
    if config.max_attempts == 0 {
        Box::new(UnboundedRedelivery)
    } else {
        Box::new(DeadLetterPolicy::new(config.max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let policy = DeadLetterPolicy::new(3);
        let event = AnchorEvent::builder("transaction_error").build();

        assert_eq!(policy.on_failure(&event, 1), RedeliveryDecision::Retry);
        assert_eq!(policy.on_failure(&event, 2), RedeliveryDecision::Retry);
        assert_eq!(policy.on_failure(&event, 3), RedeliveryDecision::DeadLetter);
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let event = AnchorEvent::builder("transaction_error").build();
        assert_eq!(
            UnboundedRedelivery.on_failure(&event, u32::MAX),
            RedeliveryDecision::Retry
        );
    }

    #[test]
    fn test_policy_from_config() {
        let event = AnchorEvent::builder("transaction_error").build();

        let unbounded = policy_from_config(&DispatchConfig::default());
        assert_eq!(unbounded.on_failure(&event, 100), RedeliveryDecision::Retry);

        let bounded = policy_from_config(&DispatchConfig {
            max_attempts: 1,
            ..Default::default()
        });
        assert_eq!(bounded.on_failure(&event, 1), RedeliveryDecision::DeadLetter);
    }
}
