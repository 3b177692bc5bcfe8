//! SeaORM entity models
//!
//! Database entities for PulseGrid

mod competitor;
mod metric_snapshot;
mod platform;
mod recommendation;
mod session;

pub use platform::{
    Entity as PlatformEntity,
    Model as Platform,
    ActiveModel as PlatformActiveModel,
    Column as PlatformColumn,
};

pub use session::{
    Entity as SessionEntity,
    Model as Session,
    ActiveModel as SessionActiveModel,
    Column as SessionColumn,
    CookieRecord,
};

pub use recommendation::{
    Entity as RecommendationEntity,
    Model as Recommendation,
    ActiveModel as RecommendationActiveModel,
    Column as RecommendationColumn,
};

pub use competitor::{
    Entity as CompetitorEntity,
    Model as Competitor,
    ActiveModel as CompetitorActiveModel,
    Column as CompetitorColumn,
};

pub use metric_snapshot::{
    Entity as MetricSnapshotEntity,
    Model as MetricSnapshot,
    ActiveModel as MetricSnapshotActiveModel,
    Column as MetricSnapshotColumn,
};
