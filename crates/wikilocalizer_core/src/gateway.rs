use std::collections::BTreeMap;

use anyhow::Result;

/// Read-only view of one wiki that the resolver queries.
///
/// Errors are transport failures; a missing page is `Ok(false)` / an empty map,
/// never an error.
pub trait RemoteWikiGateway {
    /// True when a page with this title exists, redirects included.
    fn page_exists(&mut self, title: &str) -> Result<bool>;

    /// One redirect hop. `None` when the page is not a redirect.
    fn get_redirect_target(&mut self, title: &str) -> Result<Option<String>>;

    /// Inter-language links of the page, keyed by language code.
    fn get_interlanguage_links(&mut self, title: &str) -> Result<BTreeMap<String, String>>;
}

impl<T: RemoteWikiGateway + ?Sized> RemoteWikiGateway for &mut T {
    fn page_exists(&mut self, title: &str) -> Result<bool> {
        (**self).page_exists(title)
    }

    fn get_redirect_target(&mut self, title: &str) -> Result<Option<String>> {
        (**self).get_redirect_target(title)
    }

    fn get_interlanguage_links(&mut self, title: &str) -> Result<BTreeMap<String, String>> {
        (**self).get_interlanguage_links(title)
    }
}
