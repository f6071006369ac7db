pub mod backup;
pub mod content_sync;
pub mod document;
pub mod documents;
pub mod error;
pub mod front_matter;
pub mod history;
pub mod link_parser;
pub mod paths;
pub mod promote;
pub mod restore;
pub mod search_index;
pub mod slug_resolver;
pub mod store;
