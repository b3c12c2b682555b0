//! Field presentation strategies for interlaced sources.

use std::time::Duration;

use color::FieldSelect;
use serde::{Deserialize, Serialize};

use crate::geometry::ResolutionClass;
use crate::gpu::{LineMask, ScanField};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterlaceMethod {
    /// Treat every frame as progressive.
    None,
    /// Bob or blend depending on the output, when the frame declares a parity.
    #[default]
    Auto,
    Bob,
    BobInverted,
    Weave,
    WeaveInverted,
    Blend,
}

/// Fields to present for one flipped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum FieldSync {
    #[default]
    None,
    Odd,
    Even,
    Both,
}

/// One of the two interleaved scans. `Odd` holds rows 0, 2, 4...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldParity {
    Odd,
    Even,
}

impl FieldParity {
    pub fn other(self) -> Self {
        match self {
            FieldParity::Odd => FieldParity::Even,
            FieldParity::Even => FieldParity::Odd,
        }
    }

    pub fn select(self) -> FieldSelect {
        match self {
            FieldParity::Odd => FieldSelect::Odd,
            FieldParity::Even => FieldSelect::Even,
        }
    }

    pub fn lines(self) -> LineMask {
        match self {
            FieldParity::Odd => LineMask::Odd,
            FieldParity::Even => LineMask::Even,
        }
    }

    pub fn sync(self) -> FieldSync {
        match self {
            FieldParity::Odd => FieldSync::Odd,
            FieldParity::Even => FieldSync::Even,
        }
    }

    pub fn matches(self, scan: ScanField) -> bool {
        matches!(
            (self, scan),
            (_, ScanField::Progressive)
                | (FieldParity::Odd, ScanField::Odd)
                | (FieldParity::Even, ScanField::Even)
        )
    }
}

/// Strategy in effect for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStrategy {
    Progressive,
    Bob { inverted: bool },
    Weave { inverted: bool },
    Blend,
}

/// A unit of work the presenter performs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// Composite the frame, or one field of it scaled to the full picture.
    Draw {
        field: Option<FieldParity>,
        lines: LineMask,
        alpha: u8,
    },
    /// Hold the flip until the display scans this field.
    AwaitScan(FieldParity),
    Present(FieldSync),
    /// Let the previous present stay on screen for its share of the budget.
    Pace(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentPlan {
    pub strategy: PresentStrategy,
    pub steps: Vec<PlanStep>,
}

impl PresentPlan {
    pub fn presents(&self) -> impl Iterator<Item = FieldSync> + '_ {
        self.steps.iter().filter_map(|s| match s {
            PlanStep::Present(field) => Some(*field),
            _ => None,
        })
    }
}

/// Running presentation time budget. Credited once per flipped frame and
/// debited by each present, so jitter carries over instead of accumulating.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBudget {
    remaining: Duration,
    last_credit: Duration,
}

impl TimeBudget {
    pub fn credit(&mut self, delay: Duration) {
        self.last_credit = delay;
        self.remaining = (self.remaining + delay).min(delay * 4);
    }

    /// Share of the remaining budget for the next of `presents_left` presents.
    pub fn slice(&self, presents_left: u32) -> Duration {
        self.remaining / presents_left.max(1)
    }

    pub fn debit(&mut self, spent: Duration) {
        self.remaining = self.remaining.saturating_sub(spent);
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

#[derive(Debug, Clone)]
pub struct DeinterlaceScheduler {
    method: InterlaceMethod,
    class: ResolutionClass,
    budget: TimeBudget,
}

impl DeinterlaceScheduler {
    pub fn new(method: InterlaceMethod, class: ResolutionClass) -> Self {
        Self {
            method,
            class,
            budget: TimeBudget::default(),
        }
    }

    pub fn method(&self) -> InterlaceMethod {
        self.method
    }

    pub fn set_method(&mut self, method: InterlaceMethod) {
        self.method = method;
    }

    pub fn set_resolution_class(&mut self, class: ResolutionClass) {
        self.class = class;
    }

    pub fn budget(&self) -> &TimeBudget {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut TimeBudget {
        &mut self.budget
    }

    /// Strategy for a frame flipped with `sync`.
    pub fn strategy(&self, sync: FieldSync) -> PresentStrategy {
        match self.method {
            InterlaceMethod::None => PresentStrategy::Progressive,
            InterlaceMethod::Auto if sync == FieldSync::None => PresentStrategy::Progressive,
            // Standard definition outputs twitter under bob; blend them instead.
            InterlaceMethod::Auto if self.class.is_sd() => PresentStrategy::Blend,
            InterlaceMethod::Auto => PresentStrategy::Bob { inverted: false },
            InterlaceMethod::Bob => PresentStrategy::Bob { inverted: false },
            InterlaceMethod::BobInverted => PresentStrategy::Bob { inverted: true },
            InterlaceMethod::Weave => PresentStrategy::Weave { inverted: false },
            InterlaceMethod::WeaveInverted => PresentStrategy::Weave { inverted: true },
            InterlaceMethod::Blend => PresentStrategy::Blend,
        }
    }

    /// Fields to output, in order. Inverted strategies swap each declared parity.
    fn fields(sync: FieldSync, inverted: bool) -> Vec<FieldParity> {
        let order = match sync {
            FieldSync::Odd => vec![FieldParity::Odd],
            FieldSync::Even => vec![FieldParity::Even],
            FieldSync::Both | FieldSync::None => vec![FieldParity::Odd, FieldParity::Even],
        };
        if inverted {
            order.into_iter().map(FieldParity::other).collect()
        } else {
            order
        }
    }

    /// Builds the steps for one frame and credits `delay` to the budget.
    pub fn plan(&mut self, sync: FieldSync, delay: Duration) -> PresentPlan {
        self.budget.credit(delay);
        let strategy = self.strategy(sync);
        let mut steps = Vec::new();
        match strategy {
            PresentStrategy::Progressive => {
                steps.push(PlanStep::Draw {
                    field: None,
                    lines: LineMask::All,
                    alpha: 255,
                });
                steps.push(PlanStep::Present(FieldSync::None));
            }
            PresentStrategy::Bob { inverted } => {
                let fields = Self::fields(sync, inverted);
                let count = fields.len() as u32;
                for (index, field) in fields.into_iter().enumerate() {
                    if index > 0 {
                        steps.push(PlanStep::Pace(self.budget.slice(count - index as u32 + 1)));
                    }
                    steps.push(PlanStep::Draw {
                        field: Some(field),
                        lines: LineMask::All,
                        alpha: 255,
                    });
                    steps.push(PlanStep::Present(field.sync()));
                }
            }
            PresentStrategy::Weave { inverted } => {
                let fields = Self::fields(sync, inverted);
                let first = fields[0];
                let (lines, label) = match (sync, fields.as_slice()) {
                    (FieldSync::Odd | FieldSync::Even, [single]) => (single.lines(), single.sync()),
                    _ => (LineMask::All, FieldSync::Both),
                };
                steps.push(PlanStep::Draw {
                    field: None,
                    lines,
                    alpha: 255,
                });
                steps.push(PlanStep::AwaitScan(first));
                steps.push(PlanStep::Present(label));
            }
            PresentStrategy::Blend => {
                let fields = Self::fields(sync, false);
                let dominant = fields[0];
                steps.push(PlanStep::Draw {
                    field: Some(dominant),
                    lines: LineMask::All,
                    alpha: 255,
                });
                steps.push(PlanStep::Draw {
                    field: Some(dominant.other()),
                    lines: LineMask::All,
                    alpha: 128,
                });
                steps.push(PlanStep::Present(FieldSync::Both));
            }
        }
        PresentPlan { strategy, steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Resolution;

    fn scheduler(method: InterlaceMethod, resolution: Resolution) -> DeinterlaceScheduler {
        DeinterlaceScheduler::new(method, resolution.class())
    }

    #[test]
    fn auto_needs_a_declared_parity() {
        let s = scheduler(InterlaceMethod::Auto, Resolution::Pal4x3);
        assert_eq!(s.strategy(FieldSync::None), PresentStrategy::Progressive);
        assert_eq!(s.strategy(FieldSync::Odd), PresentStrategy::Blend);
        let hd = scheduler(InterlaceMethod::Auto, Resolution::Hdtv1080i);
        assert_eq!(hd.strategy(FieldSync::Even), PresentStrategy::Bob { inverted: false });
    }

    #[test]
    fn bob_presents_both_fields_in_order() {
        let mut s = scheduler(InterlaceMethod::Bob, Resolution::Hdtv720p);
        let plan = s.plan(FieldSync::Both, Duration::from_millis(40));
        let labels: Vec<_> = plan.presents().collect();
        assert_eq!(labels, vec![FieldSync::Odd, FieldSync::Even]);
        assert!(plan
            .steps
            .iter()
            .any(|s| matches!(s, PlanStep::Pace(d) if *d == Duration::from_millis(20))));
    }

    #[test]
    fn inverted_bob_swaps_parity() {
        let mut s = scheduler(InterlaceMethod::BobInverted, Resolution::Hdtv720p);
        let labels: Vec<_> = s.plan(FieldSync::Odd, Duration::ZERO).presents().collect();
        assert_eq!(labels, vec![FieldSync::Even]);
        let labels: Vec<_> = s.plan(FieldSync::Both, Duration::ZERO).presents().collect();
        assert_eq!(labels, vec![FieldSync::Even, FieldSync::Odd]);
    }

    #[test]
    fn weave_waits_for_matching_scan() {
        let mut s = scheduler(InterlaceMethod::Weave, Resolution::Ntsc4x3);
        let plan = s.plan(FieldSync::Even, Duration::ZERO);
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Draw {
                    field: None,
                    lines: LineMask::Even,
                    alpha: 255
                },
                PlanStep::AwaitScan(FieldParity::Even),
                PlanStep::Present(FieldSync::Even),
            ]
        );
    }

    #[test]
    fn blend_overlays_second_field_at_half_alpha() {
        let mut s = scheduler(InterlaceMethod::Blend, Resolution::Pal4x3);
        let plan = s.plan(FieldSync::Even, Duration::ZERO);
        assert!(plan.steps.contains(&PlanStep::Draw {
            field: Some(FieldParity::Odd),
            lines: LineMask::All,
            alpha: 128
        }));
        assert_eq!(plan.presents().count(), 1);
    }

    #[test]
    fn budget_carries_jitter() {
        let mut budget = TimeBudget::default();
        budget.credit(Duration::from_millis(40));
        assert_eq!(budget.slice(2), Duration::from_millis(20));
        budget.debit(Duration::from_millis(25));
        budget.credit(Duration::from_millis(40));
        assert_eq!(budget.remaining(), Duration::from_millis(55));
    }

    #[test]
    fn scan_matching() {
        assert!(FieldParity::Odd.matches(ScanField::Odd));
        assert!(!FieldParity::Odd.matches(ScanField::Even));
        assert!(FieldParity::Even.matches(ScanField::Progressive));
    }
}
