//! Visibility/prefetch priority aggregation
//!
//! Several render layers can share one chunk source. Each contributes a
//! visibility scalar: `+inf` means "currently visible, always schedule", any
//! finite value is a prefetch rank, `-inf` means "ignored". The aggregator
//! tracks the maximum across contributors and notifies watchers when the
//! effective value changes.

use tokio::sync::watch;

use crate::chunk::PriorityTier;

/// Handle to one contributor's slot in a [`VisibilityAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityContributor(usize);

#[derive(Debug)]
pub struct VisibilityAggregator {
    contributors: Vec<Option<f32>>,
    free: Vec<usize>,
    effective: f32,
    changed_tx: watch::Sender<f32>,
}

impl Default for VisibilityAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilityAggregator {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(f32::NEG_INFINITY);
        Self {
            contributors: Vec::new(),
            free: Vec::new(),
            effective: f32::NEG_INFINITY,
            changed_tx,
        }
    }

    /// Register a contributor with an initial visibility.
    pub fn add(&mut self, visibility: f32) -> VisibilityContributor {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.contributors[slot] = Some(visibility);
                slot
            }
            None => {
                self.contributors.push(Some(visibility));
                self.contributors.len() - 1
            }
        };
        self.recompute();
        VisibilityContributor(slot)
    }

    pub fn set(&mut self, contributor: VisibilityContributor, visibility: f32) {
        let slot = self.contributors[contributor.0]
            .as_mut()
            .expect("contributor was removed");
        if *slot == visibility {
            return;
        }
        *slot = visibility;
        self.recompute();
    }

    pub fn remove(&mut self, contributor: VisibilityContributor) {
        assert!(
            self.contributors[contributor.0].take().is_some(),
            "contributor was already removed"
        );
        self.free.push(contributor.0);
        self.recompute();
    }

    /// The maximum visibility across live contributors, `-inf` when empty.
    pub fn effective(&self) -> f32 {
        self.effective
    }

    /// Watch channel carrying the effective visibility.
    pub fn changes(&self) -> watch::Receiver<f32> {
        self.changed_tx.subscribe()
    }

    fn recompute(&mut self) {
        let effective = self
            .contributors
            .iter()
            .flatten()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if effective != self.effective {
            self.effective = effective;
            let _ = self.changed_tx.send(effective);
        }
    }
}

/// The tier a chunk should be requested at for a given effective
/// visibility, or `None` when it should not be requested at all.
pub fn effective_tier(visibility: f32) -> Option<PriorityTier> {
    if visibility == f32::INFINITY {
        Some(PriorityTier::Visible)
    } else if visibility == f32::NEG_INFINITY {
        None
    } else {
        Some(PriorityTier::Prefetch)
    }
}
