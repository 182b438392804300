//! Bounded HTTP fetching and the local image cache.

pub mod http;
pub mod images;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use images::{extension_from_url, FsImageCache, ImageCache, StoredImage};

pub const CRATE_NAME: &str = "egw-storage";
