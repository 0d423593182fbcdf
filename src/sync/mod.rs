pub mod achievements;
pub mod delta;
pub mod session;

pub use achievements::{AchievementReconciler, MetadataResolver, NewlyUnlocked, RemoteAchievement};
pub use delta::{always_new, became_true, DeltaDetector, Flagged, NativeOrder};
pub use session::{MergeDecision, SessionMerger};
