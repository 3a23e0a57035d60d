//! Filtered, sorted and paginated listing.

pub mod builder;
pub mod engine;
pub mod params;

pub use builder::{escape_like, ListQueryBuilder};
pub use engine::{ListEngine, ListPage};
pub use params::{KeyFilter, ListParams, Page, RawListParams, SortKey};
