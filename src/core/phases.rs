use crate::core::model::TrainableScope;
use crate::io::blob_store::{ArtifactKeys, SnapshotKind};
use std::fmt;

/// Index of the last training phase
pub const FINAL_PHASE: usize = 3;

/// Mid-phase checkpoints of the last phase are written every this many epochs
pub const CHECKPOINT_INTERVAL: usize = 5;

/// Whether the final phase uploads a checkpoint after finishing `epoch`
pub fn is_checkpoint_epoch(epoch: usize) -> bool {
    epoch > 0 && epoch % CHECKPOINT_INTERVAL == 0
}

/// Epoch counts and learning rates of the four phases
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSchedule {
    pub epochs: [usize; 4],
    pub learning_rates: [f32; 4],
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        Self {
            epochs: [5; 4],
            learning_rates: [0.01, 0.001, 0.01, 0.001],
        }
    }
}

/// Where the staged training currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Phase0,
    Phase1,
    Phase2,
    Phase3,
    /// Final phase restarted from a mid-phase checkpoint at this epoch
    Phase3Resume(usize),
    Done,
}

/// Everything the training loop needs to run one phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSpec {
    pub phase: usize,
    pub scope: TrainableScope,
    pub learning_rate: f32,
    pub epochs: usize,
    pub start_epoch: usize,
    pub checkpoints: bool,
    /// Added to the run seed before the phase starts sampling
    pub seed_offset: u64,
}

impl PhaseState {
    /// State that follows a completed phase boundary
    pub fn after_boundary(phase: usize) -> Self {
        match phase {
            0 => PhaseState::Phase1,
            1 => PhaseState::Phase2,
            2 => PhaseState::Phase3,
            _ => PhaseState::Done,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            PhaseState::Phase0 => PhaseState::Phase1,
            PhaseState::Phase1 => PhaseState::Phase2,
            PhaseState::Phase2 => PhaseState::Phase3,
            PhaseState::Phase3 | PhaseState::Phase3Resume(_) | PhaseState::Done => PhaseState::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        *self == PhaseState::Done
    }

    pub fn spec(&self, schedule: &PhaseSchedule) -> Option<PhaseSpec> {
        let (phase, start_epoch, seed_offset) = match *self {
            PhaseState::Phase0 => (0, 0, 1),
            PhaseState::Phase1 => (1, 0, 2),
            PhaseState::Phase2 => (2, 0, 3),
            PhaseState::Phase3 => (3, 0, 4),
            PhaseState::Phase3Resume(epoch) => (3, epoch, 5),
            PhaseState::Done => return None,
        };
        let scope = if phase < 2 {
            TrainableScope::AdapterAndHeads
        } else {
            TrainableScope::All
        };

        Some(PhaseSpec {
            phase,
            scope,
            learning_rate: schedule.learning_rates[phase],
            epochs: schedule.epochs[phase],
            start_epoch,
            checkpoints: phase == FINAL_PHASE,
            seed_offset,
        })
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Phase0 => write!(f, "phase 0 (adapter and heads)"),
            PhaseState::Phase1 => write!(f, "phase 1 (adapter and heads again)"),
            PhaseState::Phase2 => write!(f, "phase 2 (all layers)"),
            PhaseState::Phase3 => write!(f, "phase 3 (all layers again)"),
            PhaseState::Phase3Resume(epoch) => {
                write!(f, "phase 3 (all layers from checkpoint at epoch {})", epoch)
            }
            PhaseState::Done => write!(f, "done"),
        }
    }
}

/// Starting state of a run and the snapshot to restore first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub state: PhaseState,
    /// Key of the model snapshot to load; `None` starts from a fresh model
    pub snapshot: Option<String>,
}

/// Decide where a run picks up from the keys stored under its prefix
///
/// An explicit `start_from` key restarts the final phase from epoch 0. A
/// completed final phase means there is nothing left to train. Otherwise
/// the newest mid-phase checkpoint wins over phase boundaries, and the
/// highest boundary comes next.
pub fn plan_resume(keys: &[String], start_from: Option<&str>) -> ResumePlan {
    if let Some(key) = start_from {
        return ResumePlan {
            state: PhaseState::Phase3Resume(0),
            snapshot: Some(key.to_string()),
        };
    }

    let mut boundary: Option<(usize, &String)> = None;
    let mut checkpoint: Option<(usize, &String)> = None;
    let mut final_model: Option<&String> = None;

    for key in keys {
        match ArtifactKeys::classify(key) {
            Some(SnapshotKind::Phase(phase)) if phase <= FINAL_PHASE => {
                if boundary.map_or(true, |(best, _)| phase > best) {
                    boundary = Some((phase, key));
                }
            }
            Some(SnapshotKind::Checkpoint(epoch)) if epoch > 0 => {
                if checkpoint.map_or(true, |(best, _)| epoch > best) {
                    checkpoint = Some((epoch, key));
                }
            }
            Some(SnapshotKind::Final) => final_model = Some(key),
            Some(other) => log::debug!("Ignoring snapshot {} ({:?})", key, other),
            None => {}
        }
    }

    let finished = boundary.map_or(false, |(phase, _)| phase == FINAL_PHASE);
    if finished || final_model.is_some() {
        let snapshot = final_model.or(boundary.map(|(_, key)| key));
        return ResumePlan {
            state: PhaseState::Done,
            snapshot: snapshot.cloned(),
        };
    }

    if let Some((epoch, key)) = checkpoint {
        return ResumePlan {
            state: PhaseState::Phase3Resume(epoch),
            snapshot: Some(key.clone()),
        };
    }

    match boundary {
        Some((phase, key)) => ResumePlan {
            state: PhaseState::after_boundary(phase),
            snapshot: Some(key.clone()),
        },
        None => ResumePlan {
            state: PhaseState::Phase0,
            snapshot: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("runs/abc/{}", n)).collect()
    }

    #[test]
    fn test_fresh_run() {
        let plan = plan_resume(&keys(&["deeplab_training_args.txt"]), None);
        assert_eq!(plan.state, PhaseState::Phase0);
        assert_eq!(plan.snapshot, None);
    }

    #[test]
    fn test_resume_after_boundary() {
        let plan = plan_resume(&keys(&["deeplab_0.pth", "deeplab_1.pth"]), None);
        assert_eq!(plan.state, PhaseState::Phase2);
        assert_eq!(plan.snapshot.as_deref(), Some("runs/abc/deeplab_1.pth"));
    }

    #[test]
    fn test_checkpoint_wins_over_boundaries() {
        let plan = plan_resume(
            &keys(&[
                "deeplab_0.pth",
                "deeplab_1.pth",
                "deeplab_2.pth",
                "deeplab_checkpoint_10.pth",
                "deeplab_checkpoint_5.pth",
            ]),
            None,
        );
        assert_eq!(plan.state, PhaseState::Phase3Resume(10));
        assert_eq!(
            plan.snapshot.as_deref(),
            Some("runs/abc/deeplab_checkpoint_10.pth")
        );
    }

    #[test]
    fn test_completed_run() {
        let plan = plan_resume(
            &keys(&[
                "deeplab.pth",
                "deeplab_2.pth",
                "deeplab_3.pth",
                "deeplab_checkpoint_5.pth",
            ]),
            None,
        );
        assert_eq!(plan.state, PhaseState::Done);
        assert_eq!(plan.snapshot.as_deref(), Some("runs/abc/deeplab.pth"));
    }

    #[test]
    fn test_explicit_start_overrides_scan() {
        let plan = plan_resume(&keys(&["deeplab_3.pth"]), Some("elsewhere/model.pth"));
        assert_eq!(plan.state, PhaseState::Phase3Resume(0));
        assert_eq!(plan.snapshot.as_deref(), Some("elsewhere/model.pth"));
    }

    #[test]
    fn test_phase_table() {
        let schedule = PhaseSchedule {
            epochs: [1, 2, 3, 4],
            learning_rates: [1.0, 2.0, 3.0, 4.0],
        };

        let mut state = PhaseState::Phase0;
        let mut specs = Vec::new();
        while let Some(spec) = state.spec(&schedule) {
            specs.push(spec);
            state = state.next();
        }
        assert!(state.is_done());
        assert_eq!(specs.len(), 4);

        for (i, spec) in specs.iter().enumerate() {
            assert_eq!(spec.phase, i);
            assert_eq!(spec.epochs, i + 1);
            assert_eq!(spec.learning_rate, (i + 1) as f32);
            assert_eq!(spec.seed_offset, i as u64 + 1);
            assert_eq!(spec.checkpoints, i == 3);
        }
        assert_eq!(specs[1].scope, TrainableScope::AdapterAndHeads);
        assert_eq!(specs[2].scope, TrainableScope::All);

        let resume = PhaseState::Phase3Resume(5).spec(&schedule).unwrap();
        assert_eq!(resume.start_epoch, 5);
        assert_eq!(resume.learning_rate, 4.0);
        assert_eq!(PhaseState::Phase3Resume(5).next(), PhaseState::Done);
    }

    #[test]
    fn test_checkpoint_epochs() {
        let epochs: Vec<usize> = (0..16).filter(|&e| is_checkpoint_epoch(e)).collect();
        assert_eq!(epochs, vec![5, 10, 15]);
    }
}
