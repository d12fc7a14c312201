//! Contextual multi-armed bandit (CMAB) decision seam.
//!
//! Experiments carrying a CMAB marker do not hash users onto variations;
//! they ask an external prediction service instead. The service is consulted
//! through [`CmabClient`] and fronted by an LRU cache keyed per (user, rule)
//! and guarded by a hash of the relevant attribute subset, so a user only
//! triggers a new prediction when their targeted attributes change. Failures
//! degrade to "no decision".
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;

use crate::datafile::ProjectConfig;
use crate::decision::{DecideOption, UserSnapshot};

/// Default capacity of the CMAB decision cache.
pub const DEFAULT_CMAB_CACHE_SIZE: usize = 1000;

const PREDICTION_URL: &str = "https://prediction.cmab.optimizely.com/predict";
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A decision produced by the CMAB service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabDecision {
    pub variation_id: String,
    /// Uuid attached to the prediction request, carried through to event
    /// payloads for attribution.
    pub cmab_uuid: String,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CmabError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    #[error("invalid CMAB response")]
    InvalidResponse,

    #[error("{0}")]
    Client(String),
}

/// Transport seam: fetch a variation id for (rule, user, attributes).
pub trait CmabClient: Send + Sync {
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
        cmab_uuid: &str,
    ) -> Result<String, CmabError>;
}

#[derive(Debug, Clone)]
struct CmabCacheValue {
    attributes_hash: String,
    variation_id: String,
    cmab_uuid: String,
}

/// Caching layer over a [`CmabClient`].
pub struct CmabService {
    client: Arc<dyn CmabClient>,
    cache: Mutex<LruCache<String, CmabCacheValue>>,
}

impl CmabService {
    pub fn new(client: Arc<dyn CmabClient>) -> CmabService {
        let capacity = NonZeroUsize::new(DEFAULT_CMAB_CACHE_SIZE)
            .expect("default cache size is non-zero");
        CmabService::with_cache_size(client, capacity)
    }

    pub fn with_cache_size(client: Arc<dyn CmabClient>, capacity: NonZeroUsize) -> CmabService {
        CmabService {
            client,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserSnapshot,
        rule_id: &str,
        options: &[DecideOption],
    ) -> Result<CmabDecision, CmabError> {
        let attributes = filter_attributes(config, user, rule_id);

        if options.contains(&DecideOption::IgnoreCmabCache) {
            return self.fetch_decision(rule_id, &user.user_id, &attributes);
        }
        if options.contains(&DecideOption::ResetCmabCache) {
            self.lock_cache().clear();
        }

        let cache_key = cache_key(&user.user_id, rule_id);
        if options.contains(&DecideOption::InvalidateUserCmabCache) {
            self.lock_cache().pop(&cache_key);
        }

        let attributes_hash = hash_attributes(&attributes);
        {
            let mut cache = self.lock_cache();
            if let Some(cached) = cache.get(&cache_key) {
                if cached.attributes_hash == attributes_hash {
                    return Ok(CmabDecision {
                        variation_id: cached.variation_id.clone(),
                        cmab_uuid: cached.cmab_uuid.clone(),
                    });
                }
                // The user's relevant attributes changed; the cached
                // prediction no longer applies.
                cache.pop(&cache_key);
            }
        }

        let decision = self.fetch_decision(rule_id, &user.user_id, &attributes)?;
        self.lock_cache().put(
            cache_key,
            CmabCacheValue {
                attributes_hash,
                variation_id: decision.variation_id.clone(),
                cmab_uuid: decision.cmab_uuid.clone(),
            },
        );
        Ok(decision)
    }

    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CmabDecision, CmabError> {
        let cmab_uuid = uuid::Uuid::new_v4().to_string();
        let variation_id = self
            .client
            .fetch_decision(rule_id, user_id, attributes, &cmab_uuid)?;
        Ok(CmabDecision {
            variation_id,
            cmab_uuid,
        })
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, CmabCacheValue>> {
        // Err() is possible only if a thread panicked while holding the
        // lock, which should never happen.
        self.cache
            .lock()
            .expect("thread holding CMAB cache lock should not panic")
    }
}

/// Only the attributes the experiment's CMAB configuration names take part
/// in the prediction (and in the cache guard hash).
fn filter_attributes(
    config: &ProjectConfig,
    user: &UserSnapshot,
    rule_id: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut filtered = serde_json::Map::new();

    let Some(cmab) = config
        .experiment_by_id(rule_id)
        .and_then(|experiment| experiment.cmab.as_ref())
    else {
        return filtered;
    };

    for attribute_id in &cmab.attribute_ids {
        let Some(attribute) = config.attribute_by_id(attribute_id) else {
            continue;
        };
        if let Some(value) = user.attributes.get(&attribute.key) {
            filtered.insert(attribute.key.clone(), value.to_json());
        }
    }
    filtered
}

fn cache_key(user_id: &str, rule_id: &str) -> String {
    format!("{}-{}-{}", user_id.len(), user_id, rule_id)
}

fn hash_attributes(attributes: &serde_json::Map<String, serde_json::Value>) -> String {
    // serde_json maps iterate in sorted key order, so the serialization is
    // canonical for hashing.
    let canonical = serde_json::to_string(attributes)
        .expect("attribute map serialization cannot fail");
    format!("{:x}", md5::compute(canonical))
}

/// Default HTTP client for the CMAB prediction endpoint, with bounded
/// exponential-backoff retries.
pub struct HttpCmabClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpCmabClient {
    pub fn new() -> std::io::Result<HttpCmabClient> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(HttpCmabClient {
            runtime,
            client: reqwest::Client::new(),
            max_retries: MAX_RETRIES,
        })
    }

    fn try_fetch(&self, url: &str, body: &serde_json::Value) -> Result<String, CmabError> {
        #[derive(serde::Deserialize)]
        struct Prediction {
            variation_id: String,
        }
        #[derive(serde::Deserialize)]
        struct PredictionResponse {
            predictions: Vec<Prediction>,
        }

        let response: PredictionResponse = self.runtime.block_on(async {
            self.client
                .post(url)
                .json(body)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
        })?;

        response
            .predictions
            .into_iter()
            .next()
            .map(|prediction| prediction.variation_id)
            .ok_or(CmabError::InvalidResponse)
    }
}

impl CmabClient for HttpCmabClient {
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
        cmab_uuid: &str,
    ) -> Result<String, CmabError> {
        let url = format!("{PREDICTION_URL}/{rule_id}");
        let body = serde_json::json!({
            "instances": [{
                "visitorId": user_id,
                "experimentId": rule_id,
                "attributes": attributes
                    .iter()
                    .map(|(key, value)| serde_json::json!({
                        "id": key,
                        "value": value,
                        "type": "custom_attribute",
                    }))
                    .collect::<Vec<_>>(),
                "cmabUUID": cmab_uuid,
            }]
        });

        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            match self.try_fetch(&url, &body) {
                Ok(variation_id) => return Ok(variation_id),
                Err(err) if attempt < self.max_retries => {
                    log::warn!(target: "splitstream",
                        "CMAB request for rule \"{rule_id}\" failed (attempt {attempt}): {err}, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
