//! Source-side adapters: locating node databases and their stores, and reading token rows.

mod extractor;
mod locator;

pub use extractor::{ExtractError, TokenExtractor, TOKENS_TABLE};
pub use locator::{
    discover, DiscoveryError, SourceLocator, BINARY_NAME, MAX_WALK_LEVELS, PLATFORM_BINARY,
    STORE_DIR_NAME, STORE_MARKERS, SYSTEM_BINARY_PATHS,
};

pub const CRATE_NAME: &str = "tsync-adapters";
