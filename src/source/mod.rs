//! Network-backed collaborators: thread fetching and board index pages.

pub mod http;
pub mod pages;
pub mod saved;

pub use http::HttpThreadSource;
pub use pages::BoardPageCache;
pub use saved::SavedReplies;
