use super::round::Phase;
use serde::{Deserialize, Serialize};

/// Why an input is being punished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disruption {
    /// Registered but never confirmed the connection.
    FailedToConfirm,
    /// Confirmed and took part in output registration but never signed.
    FailedToSign,
    /// The coin disappeared from the UTXO set while registered.
    SpentDuringRound { phase: Phase },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Punishment {
    pub severity: u32,
    /// Soft ban: recorded but only enforced when noted inputs are refused.
    pub noted: bool,
}

/// Maps a disruption to a punishment. `None` means the disruption is ignored.
pub trait SeverityPolicy: Send + Sync {
    fn punishment(&self, disruption: Disruption) -> Option<Punishment>;
}

/// Severity constants read from the coordinator config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub failed_to_confirm: u32,
    pub failed_to_confirm_noted: bool,
    pub failed_to_sign: u32,
    /// Per phase already reached, so a coin spent during signing costs more
    /// than one spent during input registration.
    pub spent_per_phase: u32,
    /// Spends seen before output registration are ambiguous and only noted.
    pub spent_noted_before_output_registration: bool,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            failed_to_confirm: 1,
            failed_to_confirm_noted: true,
            failed_to_sign: 2,
            spent_per_phase: 1,
            spent_noted_before_output_registration: true,
        }
    }
}

fn phase_weight(phase: Phase) -> u32 {
    match phase {
        Phase::InputRegistration => 1,
        Phase::ConnectionConfirmation => 2,
        Phase::OutputRegistration => 3,
        Phase::TransactionSigning | Phase::Ended => 4,
    }
}

impl SeverityPolicy for SeverityConfig {
    fn punishment(&self, disruption: Disruption) -> Option<Punishment> {
        let (severity, noted) = match disruption {
            Disruption::FailedToConfirm => (self.failed_to_confirm, self.failed_to_confirm_noted),
            Disruption::FailedToSign => (self.failed_to_sign, false),
            Disruption::SpentDuringRound { phase } => (
                self.spent_per_phase.saturating_mul(phase_weight(phase)),
                self.spent_noted_before_output_registration && phase < Phase::OutputRegistration,
            ),
        };
        (severity > 0).then_some(Punishment { severity, noted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_spends_are_worse() {
        let policy = SeverityConfig::default();
        let early = policy
            .punishment(Disruption::SpentDuringRound {
                phase: Phase::InputRegistration,
            })
            .unwrap();
        let late = policy
            .punishment(Disruption::SpentDuringRound {
                phase: Phase::TransactionSigning,
            })
            .unwrap();
        assert!(early.noted);
        assert!(!late.noted);
        assert!(late.severity > early.severity);
    }

    #[test]
    fn zero_severity_disables_punishment() {
        let policy = SeverityConfig {
            failed_to_confirm: 0,
            ..SeverityConfig::default()
        };
        assert_eq!(policy.punishment(Disruption::FailedToConfirm), None);
        assert!(policy.punishment(Disruption::FailedToSign).is_some());
    }
}
