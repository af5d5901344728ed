/// Ceiling on the input value a fresh standard round will accept.
///
/// Each round that fills up steps the ceiling up tenfold, but never to or
/// past the registrable maximum. A failed input registration resets it to
/// the registrable maximum, and the next success restarts the ladder from
/// the base. Blame rounds leave it alone.
#[derive(Clone, Debug)]
pub struct MaxSuggestedAmountProvider {
    base: u64,
    max_registrable: u64,
    current: u64,
    /// Set after a reset so the next step restarts from `base`.
    restart: bool,
}

impl MaxSuggestedAmountProvider {
    pub fn new(base: u64, max_registrable: u64) -> Self {
        Self {
            base: base.min(max_registrable),
            max_registrable,
            current: base.min(max_registrable),
            restart: false,
        }
    }

    pub fn max_suggested_amount(&self) -> u64 {
        self.current
    }

    pub fn max_registrable_amount(&self) -> u64 {
        self.max_registrable
    }

    pub fn step_max_suggested(&mut self, is_blame_round: bool) {
        if is_blame_round {
            return;
        }
        if self.restart {
            self.restart = false;
            self.current = self.base;
            return;
        }
        let next = self.current.saturating_mul(10);
        if next < self.max_registrable {
            self.current = next;
        }
    }

    pub fn reset_max_suggested(&mut self, is_blame_round: bool) {
        if is_blame_round {
            return;
        }
        self.current = self.max_registrable;
        self.restart = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ladder_caps_below_max() {
        let mut p = MaxSuggestedAmountProvider::new(100_000, 1_000_000_000);
        let mut seen = vec![p.max_suggested_amount()];
        for _ in 0..5 {
            p.step_max_suggested(false);
            seen.push(p.max_suggested_amount());
        }
        assert_eq!(
            seen,
            vec![100_000, 1_000_000, 10_000_000, 100_000_000, 100_000_000, 100_000_000]
        );
    }

    #[test]
    fn reset_opens_to_max_then_restarts() {
        let mut p = MaxSuggestedAmountProvider::new(100_000, 1_000_000_000);
        p.step_max_suggested(false);
        p.reset_max_suggested(false);
        assert_eq!(p.max_suggested_amount(), 1_000_000_000);
        p.step_max_suggested(false);
        assert_eq!(p.max_suggested_amount(), 100_000);
        p.step_max_suggested(false);
        assert_eq!(p.max_suggested_amount(), 1_000_000);
    }

    #[test]
    fn blame_rounds_do_not_move_the_ceiling() {
        let mut p = MaxSuggestedAmountProvider::new(100_000, 1_000_000_000);
        p.step_max_suggested(true);
        p.reset_max_suggested(true);
        assert_eq!(p.max_suggested_amount(), 100_000);
    }

    #[test]
    fn base_above_max_is_clamped() {
        let p = MaxSuggestedAmountProvider::new(5_000, 1_000);
        assert_eq!(p.max_suggested_amount(), 1_000);
    }

    proptest! {
        #[test]
        fn stays_within_bounds(
            base in 0u64..2_000_000_000,
            max in 1u64..2_000_000_000,
            ops in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..64),
        ) {
            let mut p = MaxSuggestedAmountProvider::new(base, max);
            for (step, blame) in ops {
                if step {
                    p.step_max_suggested(blame);
                } else {
                    p.reset_max_suggested(blame);
                }
                prop_assert!(p.max_suggested_amount() <= max);
            }
        }
    }
}
