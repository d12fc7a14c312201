//! The public SDK façade.
//!
//! A [`Client`] owns the config store, the decision service, and the event
//! pipeline. It is cheap to clone and safe to share across threads; every
//! decision executes against a single configuration snapshot.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::attributes::Attributes;
use crate::cmab::{CmabClient, CmabService};
use crate::config_manager::{
    DatafileFetcher, DatafileFetcherConfig, PollingConfigManager, PollingConfigManagerConfig,
};
use crate::config_store::ConfigStore;
use crate::datafile::{
    Experiment, FeatureFlag, ProjectConfig, Variable, VariableType, Variation,
};
use crate::decision::{
    DecideOption, Decision, DecisionReasons, DecisionService, DecisionSource, FeatureDecision,
    UserSnapshot,
};
use crate::events::{
    BatchEventProcessor, BatchEventProcessorConfig, EventDispatcher, EventProcessor,
    HttpEventDispatcher, UserEventFactory,
};
use crate::notifications::{
    DecisionInfo, DecisionNotification, NotificationCenter, TrackNotification,
};
use crate::segments::{SegmentEvent, SegmentManager, SegmentSource};
use crate::user_context::UserContext;
use crate::user_profile::UserProfileService;
use crate::Result;

/// Builder for [`Client`].
///
/// # Examples
/// ```no_run
/// # fn test() -> splitstream::Result<()> {
/// let client = splitstream::Client::builder()
///     .with_sdk_key("my-sdk-key")
///     .build()?;
/// client.wait_until_ready(std::time::Duration::from_secs(10))?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ClientBuilder {
    datafile: Option<String>,
    sdk_key: Option<String>,
    datafile_access_token: Option<String>,
    url_template: Option<String>,
    event_dispatcher: Option<Arc<dyn EventDispatcher>>,
    event_processor: Option<Arc<dyn EventProcessor>>,
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    cmab_client: Option<Arc<dyn CmabClient>>,
    segment_source: Option<Arc<dyn SegmentSource>>,
    default_decide_options: Vec<DecideOption>,
    polling_config: Option<PollingConfigManagerConfig>,
    processor_config: Option<BatchEventProcessorConfig>,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Seed the client with datafile text. The datafile is parsed eagerly;
    /// invalid text fails the build.
    pub fn with_datafile(mut self, datafile: impl Into<String>) -> ClientBuilder {
        self.datafile = Some(datafile.into());
        self
    }

    /// Poll the CDN for datafiles belonging to this sdk key.
    pub fn with_sdk_key(mut self, sdk_key: impl Into<String>) -> ClientBuilder {
        self.sdk_key = Some(sdk_key.into());
        self
    }

    /// Use the authenticated datafile endpoint with this access token.
    pub fn with_datafile_access_token(mut self, token: impl Into<String>) -> ClientBuilder {
        self.datafile_access_token = Some(token.into());
        self
    }

    /// Override the datafile URL template (placeholder: `{sdk_key}`).
    pub fn with_datafile_url_template(mut self, template: impl Into<String>) -> ClientBuilder {
        self.url_template = Some(template.into());
        self
    }

    pub fn with_event_dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> ClientBuilder {
        self.event_dispatcher = Some(dispatcher);
        self
    }

    /// Replace the whole event processor (the default is a
    /// [`BatchEventProcessor`] over the configured dispatcher).
    pub fn with_event_processor(mut self, processor: Arc<dyn EventProcessor>) -> ClientBuilder {
        self.event_processor = Some(processor);
        self
    }

    pub fn with_user_profile_service(
        mut self,
        service: Arc<dyn UserProfileService>,
    ) -> ClientBuilder {
        self.user_profile_service = Some(service);
        self
    }

    pub fn with_cmab_client(mut self, client: Arc<dyn CmabClient>) -> ClientBuilder {
        self.cmab_client = Some(client);
        self
    }

    pub fn with_segment_source(mut self, source: Arc<dyn SegmentSource>) -> ClientBuilder {
        self.segment_source = Some(source);
        self
    }

    /// Options applied to every `decide` call, merged with per-call options.
    pub fn with_default_decide_options(mut self, options: Vec<DecideOption>) -> ClientBuilder {
        self.default_decide_options = options;
        self
    }

    pub fn with_polling_config(mut self, config: PollingConfigManagerConfig) -> ClientBuilder {
        self.polling_config = Some(config);
        self
    }

    pub fn with_event_processor_config(
        mut self,
        config: BatchEventProcessorConfig,
    ) -> ClientBuilder {
        self.processor_config = Some(config);
        self
    }

    pub fn build(self) -> Result<Client> {
        let notifications = Arc::new(NotificationCenter::new());
        let config_store = Arc::new(ConfigStore::new());

        if let Some(datafile) = &self.datafile {
            config_store.set_config(Arc::new(ProjectConfig::parse(datafile)?));
        }

        let poller = match &self.sdk_key {
            Some(sdk_key) => {
                let fetcher = DatafileFetcher::new(DatafileFetcherConfig {
                    sdk_key: sdk_key.clone(),
                    datafile_access_token: self.datafile_access_token.clone(),
                    url_template: self.url_template.clone(),
                });
                Some(PollingConfigManager::start(
                    fetcher,
                    config_store.clone(),
                    notifications.clone(),
                    self.polling_config.unwrap_or_default(),
                )?)
            }
            None => {
                if self.datafile.is_none() {
                    log::warn!(target: "splitstream",
                        "client built without a datafile or sdk key, all decisions will be empty");
                }
                None
            }
        };

        let event_processor: Arc<dyn EventProcessor> = match self.event_processor {
            Some(processor) => processor,
            None => {
                let dispatcher: Arc<dyn EventDispatcher> = match self.event_dispatcher {
                    Some(dispatcher) => dispatcher,
                    None => Arc::new(HttpEventDispatcher::new()?),
                };
                Arc::new(BatchEventProcessor::start(
                    dispatcher,
                    notifications.clone(),
                    self.processor_config.unwrap_or_default(),
                )?)
            }
        };

        let cmab_service = self
            .cmab_client
            .map(|client| Arc::new(CmabService::new(client)));
        let decision_service = DecisionService::new(self.user_profile_service, cmab_service);
        let segments = self.segment_source.map(SegmentManager::new);

        Ok(Client {
            inner: Arc::new(ClientInner {
                config_store,
                poller,
                event_processor,
                decision_service,
                notifications,
                segments,
                default_decide_options: self.default_decide_options,
            }),
        })
    }
}

struct ClientInner {
    config_store: Arc<ConfigStore>,
    poller: Option<PollingConfigManager>,
    event_processor: Arc<dyn EventProcessor>,
    decision_service: DecisionService,
    notifications: Arc<NotificationCenter>,
    segments: Option<SegmentManager>,
    default_decide_options: Vec<DecideOption>,
}

/// The SDK client. Clones share the same underlying state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Block until a configuration is available, bounded by `timeout`.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        if self.inner.config_store.get_config().is_some() {
            return Ok(());
        }
        match &self.inner.poller {
            Some(poller) => poller.wait_until_ready(timeout),
            None => Err(crate::Error::ConfigurationTimeout),
        }
    }

    pub fn notification_center(&self) -> &NotificationCenter {
        &self.inner.notifications
    }

    /// Flush pending events, stop the event processor, and stop the
    /// datafile poller.
    pub fn close(&self) {
        self.inner.event_processor.close();
        if let Some(poller) = &self.inner.poller {
            poller.stop();
        }
    }

    /// Create a mutable user context bound to this client.
    pub fn create_user_context(
        &self,
        user_id: impl Into<String>,
        attributes: Attributes,
    ) -> UserContext {
        UserContext::new(self.clone(), user_id.into(), attributes)
    }

    /// Activate an A/B experiment: decide and emit an impression.
    pub fn activate(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let (config, experiment, variation) =
            self.experiment_variation(experiment_key, user_id, attributes)?;

        self.send_impression(
            &config,
            Some(&*experiment),
            Some(&*variation),
            "",
            DecisionSource::Experiment.as_str(),
            true,
            user_id,
            attributes,
        );
        log::info!(target: "splitstream",
            "activating user \"{user_id}\" in experiment \"{experiment_key}\"");

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "ab-test",
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            info: DecisionInfo::ExperimentVariation {
                experiment_key: experiment_key.to_owned(),
                variation_key: Some(variation.key.clone()),
            },
        });

        Some(variation.key.clone())
    }

    /// Determine the variation for an A/B experiment without emitting an
    /// impression.
    pub fn get_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let (_, _, variation) = self.experiment_variation(experiment_key, user_id, attributes)?;

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "ab-test",
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            info: DecisionInfo::ExperimentVariation {
                experiment_key: experiment_key.to_owned(),
                variation_key: Some(variation.key.clone()),
            },
        });

        Some(variation.key.clone())
    }

    fn experiment_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<(Arc<ProjectConfig>, Arc<Experiment>, Arc<Variation>)> {
        let config = self.config()?;
        let Some(experiment) = config.experiment_by_key(experiment_key).cloned() else {
            log::warn!(target: "splitstream",
                "experiment key \"{experiment_key}\" is not in the datafile");
            return None;
        };

        let user = UserSnapshot::new(user_id, attributes.clone());
        let mut reasons = DecisionReasons::off();
        let variation =
            self.inner
                .decision_service
                .get_variation(&config, &experiment, &user, &[], &mut reasons)?;
        Some((config, experiment, variation))
    }

    /// Track a conversion event.
    pub fn track(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &Attributes,
        event_tags: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let Some(config) = self.config() else {
            return;
        };
        if config.event(event_key).is_none() {
            log::warn!(target: "splitstream",
                "event key \"{event_key}\" is not in the datafile, not tracking user \"{user_id}\"");
            return;
        }

        let tags = event_tags.unwrap_or_default();
        if let Some(event) = UserEventFactory::create_conversion_event(
            &config,
            event_key,
            user_id,
            attributes,
            tags.clone(),
        ) {
            self.inner.event_processor.process(event);
            log::info!(target: "splitstream",
                "tracking event \"{event_key}\" for user \"{user_id}\"");
        }

        self.inner.notifications.send_track(&TrackNotification {
            event_key: event_key.to_owned(),
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            event_tags: tags,
        });
    }

    /// True iff the flag decision resolves to a feature-enabled variation.
    pub fn is_feature_enabled(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> bool {
        let Some(config) = self.config() else {
            return false;
        };
        let Some(flag) = config.feature_flag(flag_key).cloned() else {
            log::warn!(target: "splitstream",
                "feature flag key \"{flag_key}\" is not in the datafile");
            return false;
        };

        let user = UserSnapshot::new(user_id, attributes.clone());
        let mut reasons = DecisionReasons::off();
        let decision = self.inner.decision_service.get_variation_for_feature(
            &config,
            &flag,
            &user,
            &[],
            &mut reasons,
        );
        let enabled = decision
            .variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled);

        if decision.source == DecisionSource::FeatureTest || config.send_flag_decisions {
            self.send_impression(
                &config,
                decision.experiment.as_deref(),
                decision.variation.as_deref(),
                flag_key,
                decision.source.as_str(),
                enabled,
                user_id,
                attributes,
            );
        }

        log::info!(target: "splitstream",
            "feature \"{flag_key}\" is {} for user \"{user_id}\"",
            if enabled { "enabled" } else { "not enabled" });

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "feature",
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            info: DecisionInfo::Feature {
                flag_key: flag_key.to_owned(),
                enabled,
                source: decision.source.as_str(),
                source_experiment_key: decision.experiment.as_ref().map(|e| e.key.clone()),
                source_variation_key: decision.variation.as_ref().map(|v| v.key.clone()),
            },
        });

        enabled
    }

    /// Keys of every flag enabled for the user, sorted.
    pub fn get_enabled_features(&self, user_id: &str, attributes: &Attributes) -> Vec<String> {
        let Some(config) = self.config() else {
            return Vec::new();
        };
        let mut enabled: Vec<String> = config
            .feature_flags()
            .filter(|flag| self.is_feature_enabled(&flag.key, user_id, attributes))
            .map(|flag| flag.key.clone())
            .collect();
        enabled.sort();
        enabled
    }

    pub fn get_feature_variable_string(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        match self.feature_variable(flag_key, variable_key, VariableType::String, user_id, attributes)? {
            serde_json::Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_feature_variable_integer(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<i64> {
        self.feature_variable(flag_key, variable_key, VariableType::Integer, user_id, attributes)?
            .as_i64()
    }

    pub fn get_feature_variable_double(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<f64> {
        self.feature_variable(flag_key, variable_key, VariableType::Double, user_id, attributes)?
            .as_f64()
    }

    pub fn get_feature_variable_boolean(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<bool> {
        self.feature_variable(flag_key, variable_key, VariableType::Boolean, user_id, attributes)?
            .as_bool()
    }

    pub fn get_feature_variable_json(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<serde_json::Value> {
        self.feature_variable(flag_key, variable_key, VariableType::Json, user_id, attributes)
    }

    /// All variable values for a flag, resolved against the user's
    /// decision. The per-variable values equal what the typed getters
    /// return for the same user.
    pub fn get_all_feature_variables(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        let config = self.config()?;
        let flag = config.feature_flag(flag_key).cloned()?;

        let user = UserSnapshot::new(user_id, attributes.clone());
        let mut reasons = DecisionReasons::off();
        let decision = self.inner.decision_service.get_variation_for_feature(
            &config,
            &flag,
            &user,
            &[],
            &mut reasons,
        );
        let enabled = decision
            .variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled);

        let variables = resolve_all_variables(&config, &flag, &decision);

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "all-feature-variables",
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            info: DecisionInfo::AllFeatureVariables {
                flag_key: flag_key.to_owned(),
                enabled,
                variable_values: variables.clone(),
            },
        });

        Some(variables)
    }

    fn feature_variable(
        &self,
        flag_key: &str,
        variable_key: &str,
        expected_type: VariableType,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<serde_json::Value> {
        let config = self.config()?;
        let Some(flag) = config.feature_flag(flag_key).cloned() else {
            log::warn!(target: "splitstream",
                "feature flag key \"{flag_key}\" is not in the datafile");
            return None;
        };
        let Some(variable) = config.variable(flag_key, variable_key) else {
            log::warn!(target: "splitstream",
                "variable \"{variable_key}\" is not in feature flag \"{flag_key}\"");
            return None;
        };
        if variable.variable_type != expected_type {
            log::warn!(target: "splitstream",
                "requested variable type \"{}\", but variable \"{variable_key}\" is of type \"{}\"",
                expected_type.as_str(), variable.variable_type.as_str());
            return None;
        }
        let variable = variable.clone();

        let user = UserSnapshot::new(user_id, attributes.clone());
        let mut reasons = DecisionReasons::off();
        let decision = self.inner.decision_service.get_variation_for_feature(
            &config,
            &flag,
            &user,
            &[],
            &mut reasons,
        );
        let enabled = decision
            .variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled);

        let value = parse_variable_value(&variable, raw_variable_value(&variable, &decision))?;

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "feature-variable",
            user_id: user_id.to_owned(),
            attributes: attributes.clone(),
            info: DecisionInfo::FeatureVariable {
                flag_key: flag_key.to_owned(),
                variable_key: variable_key.to_owned(),
                variable_type: variable.variable_type.as_str(),
                variable_value: value.clone(),
                enabled,
            },
        });

        Some(value)
    }

    /// The `decide` core shared by the user-context operations.
    pub(crate) fn decide_internal(
        &self,
        user: &UserSnapshot,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Decision {
        let options: Vec<DecideOption> = self
            .inner
            .default_decide_options
            .iter()
            .chain(options)
            .copied()
            .collect();
        let mut reasons = DecisionReasons::new(&options);

        let Some(config) = self.config() else {
            reasons.error("SDK is not ready: no datafile has been loaded.".to_owned());
            return Decision::off(flag_key, reasons.into_vec());
        };
        let Some(flag) = config.feature_flag(flag_key).cloned() else {
            let message = format!("No flag was found for key \"{flag_key}\".");
            log::warn!(target: "splitstream", "{message}");
            reasons.error(message);
            return Decision::off(flag_key, reasons.into_vec());
        };

        // A forced decision for the flag itself wins over every rule.
        let decision = match self.inner.decision_service.validated_forced_decision(
            &config,
            user,
            flag_key,
            None,
            &mut reasons,
        ) {
            Some(variation) => FeatureDecision {
                experiment: None,
                variation: Some(variation),
                source: DecisionSource::FeatureTest,
            },
            None => self.inner.decision_service.get_variation_for_feature(
                &config,
                &flag,
                user,
                &options,
                &mut reasons,
            ),
        };

        let enabled = decision
            .variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled);

        let variables = if options.contains(&DecideOption::ExcludeVariables) {
            serde_json::Map::new()
        } else {
            resolve_all_variables(&config, &flag, &decision)
        };

        let mut decision_event_dispatched = false;
        if !options.contains(&DecideOption::DisableDecisionEvent)
            && (decision.source == DecisionSource::FeatureTest || config.send_flag_decisions)
        {
            decision_event_dispatched = self.send_impression(
                &config,
                decision.experiment.as_deref(),
                decision.variation.as_deref(),
                flag_key,
                decision.source.as_str(),
                enabled,
                &user.user_id,
                &user.attributes,
            );
        }

        let variation_key = decision.variation.as_ref().map(|v| v.key.clone());
        let rule_key = decision.experiment.as_ref().map(|e| e.key.clone());
        let reasons = reasons.into_vec();

        let user_id = user.user_id.as_str();
        log::trace!(target: "splitstream", flag_key, user_id; "evaluated a flag");

        self.inner.notifications.send_decision(&DecisionNotification {
            decision_type: "flag",
            user_id: user.user_id.clone(),
            attributes: user.attributes.clone(),
            info: DecisionInfo::Flag {
                flag_key: flag_key.to_owned(),
                enabled,
                variation_key: variation_key.clone(),
                rule_key: rule_key.clone(),
                reasons: reasons.clone(),
                decision_event_dispatched,
            },
        });

        Decision {
            flag_key: flag_key.to_owned(),
            enabled,
            variation_key,
            rule_key,
            variables,
            reasons,
        }
    }

    pub(crate) fn decide_for_keys_internal(
        &self,
        user: &UserSnapshot,
        flag_keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let enabled_only = self
            .inner
            .default_decide_options
            .iter()
            .chain(options)
            .any(|option| *option == DecideOption::EnabledFlagsOnly);

        let mut decisions = HashMap::new();
        for flag_key in flag_keys {
            let decision = self.decide_internal(user, flag_key, options);
            if enabled_only && !decision.enabled {
                continue;
            }
            decisions.insert((*flag_key).to_owned(), decision);
        }
        decisions
    }

    pub(crate) fn decide_all_internal(
        &self,
        user: &UserSnapshot,
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let Some(config) = self.config() else {
            return HashMap::new();
        };
        let flag_keys: Vec<String> = config
            .feature_flags()
            .map(|flag| flag.key.clone())
            .collect();
        let keys: Vec<&str> = flag_keys.iter().map(String::as_str).collect();
        self.decide_for_keys_internal(user, &keys, options)
    }

    pub(crate) fn fetch_qualified_segments(&self, user_id: &str) -> Option<Vec<String>> {
        let Some(segments) = &self.inner.segments else {
            log::warn!(target: "splitstream",
                "no segment source is configured, cannot fetch qualified segments");
            return None;
        };
        match segments.fetch_qualified_segments(user_id) {
            Ok(segments) => Some(segments),
            Err(err) => {
                log::warn!(target: "splitstream",
                    "failed to fetch qualified segments for user \"{user_id}\": {err}");
                None
            }
        }
    }

    pub(crate) fn send_segment_event(&self, event: &SegmentEvent) {
        let Some(segments) = &self.inner.segments else {
            log::warn!(target: "splitstream",
                "no segment source is configured, dropping segment event");
            return;
        };
        if let Err(err) = segments.send_event(event) {
            log::warn!(target: "splitstream", "failed to send segment event: {err}");
        }
    }

    fn config(&self) -> Option<Arc<ProjectConfig>> {
        let config = self.inner.config_store.get_config();
        if config.is_none() {
            log::warn!(target: "splitstream",
                "no datafile has been loaded yet, returning empty results");
        }
        config
    }

    #[allow(clippy::too_many_arguments)]
    fn send_impression(
        &self,
        config: &ProjectConfig,
        experiment: Option<&Experiment>,
        variation: Option<&Variation>,
        flag_key: &str,
        rule_type: &str,
        enabled: bool,
        user_id: &str,
        attributes: &Attributes,
    ) -> bool {
        let Some(event) = UserEventFactory::create_impression_event(
            config, experiment, variation, flag_key, rule_type, enabled, user_id, attributes,
        ) else {
            return false;
        };
        self.inner.event_processor.process(event);
        true
    }
}

/// Pick the raw string value for a variable: the variation's override when
/// the decision landed on a feature-enabled variation, else the flag-level
/// default.
fn raw_variable_value<'a>(variable: &'a Variable, decision: &'a FeatureDecision) -> &'a str {
    if let Some(variation) = &decision.variation {
        if variation.feature_enabled {
            if let Some(usage) = variation
                .variables
                .iter()
                .find(|usage| usage.id == variable.id)
            {
                return &usage.value;
            }
        } else {
            log::debug!(target: "splitstream",
                "feature is not enabled, returning the default value for \"{}\"", variable.key);
        }
    }
    &variable.default_value
}

/// Coerce a raw variable string to its declared type. Returns `None` (with
/// a warning) when the datafile value does not parse.
fn parse_variable_value(variable: &Variable, raw: &str) -> Option<serde_json::Value> {
    let parsed = match variable.variable_type {
        VariableType::String => Some(serde_json::Value::String(raw.to_owned())),
        VariableType::Boolean => match raw {
            "true" => Some(serde_json::Value::Bool(true)),
            "false" => Some(serde_json::Value::Bool(false)),
            _ => None,
        },
        VariableType::Integer => raw
            .parse::<i64>()
            .ok()
            .map(|value| serde_json::Value::Number(value.into())),
        VariableType::Double => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number),
        VariableType::Json => serde_json::from_str(raw).ok(),
        VariableType::Unknown => None,
    };
    if parsed.is_none() {
        log::warn!(target: "splitstream",
            "value \"{raw}\" of variable \"{}\" cannot be parsed as {}",
            variable.key, variable.variable_type.as_str());
    }
    parsed
}

fn resolve_all_variables(
    config: &ProjectConfig,
    flag: &FeatureFlag,
    decision: &FeatureDecision,
) -> serde_json::Map<String, serde_json::Value> {
    let mut values = serde_json::Map::new();
    let Some(variables) = config.variables_for_flag(&flag.key) else {
        return values;
    };
    for variable in variables.values() {
        let value = parse_variable_value(variable, raw_variable_value(variable, decision))
            .unwrap_or(serde_json::Value::Null);
        values.insert(variable.key.clone(), value);
    }
    values
}
