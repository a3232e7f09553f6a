//! Collaborators invoked by the throttler
//!
//! The throttler never builds, signs or sends requests itself. Once a call is
//! admitted it hands the action name and parameters to a [`RequestExecutor`].
//! A [`CacheHook`] may short-circuit a call before any quota is touched.

use crate::core::{BoxError, ThrottleError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// Named request parameters, forwarded verbatim to the executor
///
/// Ordered so that equal parameter sets always produce the same cache key.
pub type Params = BTreeMap<String, String>;

/// Performs an admitted request against the remote API
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use quota_throttler::{BoxError, Params, RequestExecutor};
///
/// struct Echo;
///
/// #[async_trait]
/// impl RequestExecutor<String> for Echo {
///     async fn invoke(&self, action: &str, params: &Params) -> Result<String, BoxError> {
///         Ok(format!("{action} {params:?}"))
///     }
/// }
/// ```
#[async_trait]
pub trait RequestExecutor<R>: Send + Sync {
    /// Executes `action` with `params` and returns the remote response
    async fn invoke(&self, action: &str, params: &Params) -> Result<R, BoxError>;
}

/// Memoization layer consulted before any quota interaction
#[async_trait]
pub trait CacheHook<R>: Send + Sync {
    /// Returns a stored response for this call, if any
    async fn lookup(&self, action: &str, params: &Params) -> Option<R>;

    /// Called with every response the executor returns successfully
    fn store(&self, _action: &str, _params: &Params, _response: &R) {}
}

/// Shareable request executor
pub type SharedExecutor<R> = Arc<dyn RequestExecutor<R>>;

/// Shareable cache hook
pub type SharedCache<R> = Arc<dyn CacheHook<R>>;

/// A delegate passed around without static typing, e.g. from a registry of
/// components resolved at runtime
pub type AnyDelegate = Box<dyn Any + Send + Sync>;

/// Recovers a [`SharedExecutor`] from an untyped delegate
///
/// # Errors
///
/// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
/// `SharedExecutor<R>`.
pub fn executor_from_any<R: 'static>(
    delegate: AnyDelegate,
) -> Result<SharedExecutor<R>, ThrottleError> {
    delegate
        .downcast::<SharedExecutor<R>>()
        .map(|executor| *executor)
        .map_err(|_| ThrottleError::TypeMismatch {
            expected: type_name::<SharedExecutor<R>>(),
        })
}

/// Recovers a [`SharedCache`] from an untyped delegate
///
/// # Errors
///
/// Returns [`ThrottleError::TypeMismatch`] if the delegate is not a
/// `SharedCache<R>`.
pub fn cache_from_any<R: 'static>(delegate: AnyDelegate) -> Result<SharedCache<R>, ThrottleError> {
    delegate
        .downcast::<SharedCache<R>>()
        .map(|cache| *cache)
        .map_err(|_| ThrottleError::TypeMismatch {
            expected: type_name::<SharedCache<R>>(),
        })
}

/// Identity of a call for caching purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    action: String,
    params: Vec<(String, String)>,
}

impl CacheKey {
    /// Builds the key for `action` called with `params`
    pub fn new(action: &str, params: &Params) -> Self {
        CacheKey {
            action: action.to_string(),
            params: params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    /// The action part of the key
    pub fn action(&self) -> &str {
        &self.action
    }
}

/// In-process cache hook that remembers every successful response
///
/// ```
/// use quota_throttler::{CacheHook, MemoryCache, Params};
///
/// # tokio_test_block_on(async {
/// let cache: MemoryCache<String> = MemoryCache::new();
/// cache.insert("GetServiceStatus", &Params::new(), "GREEN".to_string());
///
/// let hit = cache.lookup("GetServiceStatus", &Params::new()).await;
/// assert_eq!(hit.as_deref(), Some("GREEN"));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryCache<R> {
    entries: Mutex<HashMap<CacheKey, R>>,
}

impl<R: Clone> MemoryCache<R> {
    /// Creates an empty cache
    pub fn new() -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a response for `action` with `params`
    pub fn insert(&self, action: &str, params: &Params, response: R) -> Option<R> {
        self.entries
            .lock()
            .insert(CacheKey::new(action, params), response)
    }

    /// Drops a stored response
    pub fn remove(&self, action: &str, params: &Params) -> Option<R> {
        self.entries.lock().remove(&CacheKey::new(action, params))
    }

    /// Number of stored responses
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every stored response
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<R: Clone> Default for MemoryCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> CacheHook<R> for MemoryCache<R>
where
    R: Clone + Send + Sync,
{
    async fn lookup(&self, action: &str, params: &Params) -> Option<R> {
        self.entries
            .lock()
            .get(&CacheKey::new(action, params))
            .cloned()
    }

    fn store(&self, action: &str, params: &Params, response: &R) {
        self.insert(action, params, response.clone());
    }
}
