//! # Queries
//!
//! Query descriptions, the backend boundary and the typed entity-set
//! facade built on top of them.

mod aggregator;
mod builder;
mod compiled;
mod entity_set;
mod info;
mod notification;
mod provider;

pub use aggregator::Aggregator;
pub use builder::{
    DeleteQueryBuilder, LiveSelectQuery, SelectQuery, SelectQueryBuilder, UpdateQueryBuilder,
};
pub use compiled::CompiledQuery;
pub use entity_set::{EntitySet, Repository, RepositoryContext};
pub use info::{
    CollectionUpdate, DeleteInfo, PropertyUpdate, QueryInfo, SortingInfo, StatementKey, UpdateInfo,
};
pub use notification::{Notification, NotificationKind};
pub use provider::{EntityUpdater, QueryProvider};
