pub mod coords;
pub mod seo;
pub mod slug;
