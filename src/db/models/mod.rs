pub mod achievement;
pub mod activity;
pub mod feed_item;

pub use achievement::AchievementRecord;
pub use activity::ActivityRecord;
pub use feed_item::FeedItemRecord;
