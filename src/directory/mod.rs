use async_trait::async_trait;

mod places;

pub use places::PlacesClient;

/// One business returned by the search provider.
#[derive(Debug, Clone)]
pub struct BusinessHit {
    pub name: String,
    pub phone: Option<String>,
}

/// One page of search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub items: Vec<BusinessHit>,
    /// Next page number, when the provider reports more results.
    pub next_page: Option<u32>,
}

/// Local-business search seam (paginated).
#[async_trait]
pub trait DirectorySearch: Send + Sync {
    async fn search(&self, query: &str, location: &str, page: u32) -> anyhow::Result<SearchPage>;
}
