//! Transaction result accumulator
//!
//! Multi-step handshakes emit small partial results: a data item, a stage
//! marker, or an error. Folding them with [`TransactionResult::merge`] combines
//! the partials without a shared mutable state object.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::TransactionError;
use crate::{MeshError, MeshResult};

// ----------------------------------------------------------------------------
// Handshake Stages
// ----------------------------------------------------------------------------

/// A discrete marker in a handshake's progression
pub trait Stage: Clone + PartialEq + fmt::Debug + Send + 'static {
    /// Whether the handshake is finished once this stage is reached
    fn is_terminal(&self) -> bool;
}

/// Stages of the peer handshake, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeStage {
    Luid,
    Advertise,
    ElectionHashed,
    ElectionReveal,
    Upgrade,
    BlockData,
    Identity,
    DeclareHashes,
    Exit,
}

impl HandshakeStage {
    /// The stage every handshake starts in
    pub const INITIAL: HandshakeStage = HandshakeStage::Luid;

    /// The following stage in the linear progression
    pub fn next(self) -> Option<Self> {
        use HandshakeStage::*;
        match self {
            Luid => Some(Advertise),
            Advertise => Some(ElectionHashed),
            ElectionHashed => Some(ElectionReveal),
            ElectionReveal => Some(Upgrade),
            Upgrade => Some(BlockData),
            BlockData => Some(Identity),
            Identity => Some(DeclareHashes),
            DeclareHashes => Some(Exit),
            Exit => None,
        }
    }
}

impl Stage for HandshakeStage {
    fn is_terminal(&self) -> bool {
        *self == HandshakeStage::Exit
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// Transaction Result
// ----------------------------------------------------------------------------

/// Partial outcome of one handshake step
#[derive(Debug)]
pub struct TransactionResult<T, S = HandshakeStage> {
    item: Option<T>,
    stage: Option<S>,
    error: Option<MeshError>,
}

impl<T, S> Default for TransactionResult<T, S> {
    fn default() -> Self {
        Self {
            item: None,
            stage: None,
            error: None,
        }
    }
}

impl<T, S: Stage> TransactionResult<T, S> {
    /// A result contributing nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of_item(item: T) -> Self {
        Self {
            item: Some(item),
            ..Self::default()
        }
    }

    pub fn of_stage(stage: S) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn of_error<E: Into<MeshError>>(error: E) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach an item to this result
    pub fn with_item(mut self, item: T) -> Self {
        self.item = Some(item);
        self
    }

    /// Attach a stage to this result
    pub fn with_stage(mut self, stage: S) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn item(&self) -> Option<&T> {
        self.item.as_ref()
    }

    pub fn stage(&self) -> Option<&S> {
        self.stage.as_ref()
    }

    pub fn error(&self) -> Option<&MeshError> {
        self.error.as_ref()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the stage marks the end of the handshake
    pub fn is_terminal(&self) -> bool {
        self.stage.as_ref().is_some_and(Stage::is_terminal)
    }

    /// Combine two partial results.
    ///
    /// An error on either side wins outright. Two different concrete stages
    /// are a conflict; otherwise whichever stage is present is kept. When both
    /// sides carry an item the right-hand one is adopted.
    pub fn merge(self, other: Self) -> Self {
        if let Some(error) = self.error {
            return Self::of_error(error);
        }
        if let Some(error) = other.error {
            return Self::of_error(error);
        }

        let stage = match (self.stage, other.stage) {
            (Some(left), Some(right)) if left != right => {
                return Self::of_error(TransactionError::StageConflict {
                    left: format!("{:?}", left),
                    right: format!("{:?}", right),
                });
            }
            (Some(left), _) => Some(left),
            (None, right) => right,
        };

        Self {
            item: other.item.or(self.item),
            stage,
            error: None,
        }
    }

    /// Move to the next step: keep the item, let `next` decide the stage
    pub fn advance(self, next: Self) -> Self {
        let carried = Self {
            item: self.item,
            stage: None,
            error: self.error,
        };
        carried.merge(next)
    }

    /// Fold any number of partial results into one
    pub fn fold<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        results.into_iter().fold(Self::empty(), Self::merge)
    }

    /// Convert into a plain result
    pub fn into_result(self) -> MeshResult<(Option<T>, Option<S>)> {
        match self.error {
            Some(error) => Err(error),
            None => Ok((self.item, self.stage)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    type Result = TransactionResult<&'static str>;

    #[test]
    fn test_item_and_stage_combine() {
        let merged = Result::of_item("x").merge(Result::of_stage(HandshakeStage::Upgrade));
        assert!(!merged.is_err());
        assert_eq!(merged.item(), Some(&"x"));
        assert_eq!(merged.stage(), Some(&HandshakeStage::Upgrade));
    }

    #[test]
    fn test_differing_stages_conflict() {
        let merged = Result::of_stage(HandshakeStage::Luid)
            .merge(Result::of_stage(HandshakeStage::Advertise));
        assert!(matches!(
            merged.error(),
            Some(MeshError::Transaction(TransactionError::StageConflict { .. }))
        ));
    }

    #[test]
    fn test_same_stage_does_not_conflict() {
        let merged = Result::of_stage(HandshakeStage::Identity)
            .merge(Result::of_stage(HandshakeStage::Identity));
        assert!(!merged.is_err());
        assert_eq!(merged.stage(), Some(&HandshakeStage::Identity));
    }

    #[test]
    fn test_no_stage_stays_unset() {
        let merged = Result::of_item("a").merge(Result::empty());
        assert_eq!(merged.stage(), None);
        assert_eq!(merged.item(), Some(&"a"));
    }

    #[test]
    fn test_error_short_circuits() {
        let merged = Result::of_item("a")
            .with_stage(HandshakeStage::Luid)
            .merge(Result::of_error(TransportError::PermissionDenied));
        assert!(matches!(
            merged.error(),
            Some(MeshError::Transport(TransportError::PermissionDenied))
        ));
        assert!(merged.item().is_none());

        let left = Result::of_error(TransportError::Cancelled).merge(Result::of_item("b"));
        assert!(matches!(
            left.into_result(),
            Err(MeshError::Transport(TransportError::Cancelled))
        ));
    }

    #[test]
    fn test_right_item_adopted_when_both_present() {
        let merged = Result::of_item("old").merge(Result::of_item("new"));
        assert_eq!(merged.item(), Some(&"new"));
    }

    #[test]
    fn test_fold_and_advance() {
        let folded = Result::fold(vec![
            Result::of_item("payload"),
            Result::empty(),
            Result::of_stage(HandshakeStage::BlockData),
        ]);
        assert_eq!(folded.stage(), Some(&HandshakeStage::BlockData));

        let advanced = folded.advance(Result::of_stage(HandshakeStage::Exit));
        assert!(advanced.is_terminal());
        let (item, stage) = advanced.into_result().unwrap();
        assert_eq!(item, Some("payload"));
        assert_eq!(stage, Some(HandshakeStage::Exit));
    }

    #[test]
    fn test_stage_progression_ends_at_exit() {
        let mut stage = HandshakeStage::INITIAL;
        let mut steps = 0;
        while let Some(next) = stage.next() {
            stage = next;
            steps += 1;
        }
        assert_eq!(stage, HandshakeStage::Exit);
        assert_eq!(steps, 8);
        assert!(stage.is_terminal());
    }
}
