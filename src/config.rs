//! Linkage settings and the engine configuration documents derived from them.
//!
//! [`LinkageSettings`] is the user-facing matching configuration (TOML, every
//! section optional). [`EngineConfig`] is the full document handed to one
//! matching-engine instance; the coordinator derives a node-side and an
//! engine-side variant from the same settings so field names line up on both
//! sides. [`RuntimeSettings`] carries per-process knobs read from the environment.

use log::warn;
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine_client::HealthPolicy;
use crate::error::ConfigError;
use crate::lifecycle::{EngineProvision, ManagedEngine, StoreControl, DEFAULT_STOP_GRACE};

/// Field type as the engine's patient schema expects it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FieldType {
    String,
    Integer,
}

/// Comparator class the engine uses for every schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Comparator {
    /// Raw strings, blinded inside the engine (node side).
    DiceCoefficientComparator,
    /// Pre-blinded bigram input (coordinator side).
    BloomFilterComparator,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DateValidation {
    pub fields: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Thresholds {
    pub is_match: f64,
    pub non_match: f64,
}

/// User matching configuration. Empty or missing sections fall back to the defaults.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkageSettings {
    pub patient_settings: BTreeMap<String, FieldType>,
    pub matcher_frequency: BTreeMap<String, f64>,
    pub matcher_error_rate: BTreeMap<String, f64>,
    pub required_fields: BTreeMap<String, bool>,
    pub validate_fields: BTreeMap<String, String>,
    pub validate_date: DateValidation,
    pub thresholds: Thresholds,
    pub exchange_groups: BTreeMap<String, Vec<String>>,
    /// Blinded fields to read back per pseudonym. Not part of the engine document.
    #[serde(skip_serializing)]
    pub result_fields: Option<Vec<String>>,
}

const NAME_PATTERN: &str =
    r"^[A-Za-zäÄöÖüÜßáÁéÉèÈ\.\- ]*[A-Za-zäÄöÖüÜßáÁéÉèÈ]+[A-Za-zäÄöÖüÜßáÁéÉèÈ\.\- ]*$";

fn table<V: Clone>(entries: &[(&str, V)]) -> BTreeMap<String, V> {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl Default for LinkageSettings {
    fn default() -> Self {
        use FieldType::{Integer, String as Str};
        Self {
            patient_settings: table(&[
                ("vorname", Str),
                ("nachname", Str),
                ("geburtsname", Str),
                ("geburtstag", Integer),
                ("geburtsmonat", Integer),
                ("geburtsjahr", Integer),
                ("ort", Str),
                ("plz", Integer),
            ]),
            matcher_frequency: table(&[
                ("vorname", 0.000235),
                ("nachname", 0.0000271),
                ("geburtsname", 0.0000271),
                ("geburtstag", 0.0333),
                ("geburtsmonat", 0.0833),
                ("geburtsjahr", 0.0286),
                ("ort", 0.01),
                ("plz", 0.01),
            ]),
            matcher_error_rate: table(&[
                ("vorname", 0.01),
                ("nachname", 0.008),
                ("geburtsname", 0.008),
                ("geburtstag", 0.005),
                ("geburtsmonat", 0.002),
                ("geburtsjahr", 0.004),
                ("ort", 0.04),
                ("plz", 0.04),
            ]),
            required_fields: table(&[
                ("vorname", true),
                ("nachname", true),
                ("geburtsname", true),
                ("geburtstag", true),
                ("geburtsmonat", true),
                ("geburtsjahr", true),
                ("ort", false),
                ("plz", false),
            ]),
            validate_fields: table(&[
                ("vorname", NAME_PATTERN.to_string()),
                ("nachname", NAME_PATTERN.to_string()),
            ]),
            validate_date: DateValidation {
                fields: vec![
                    "geburtstag".into(),
                    "geburtsmonat".into(),
                    "geburtsjahr".into(),
                ],
            },
            thresholds: Thresholds {
                is_match: 0.95,
                non_match: 0.95,
            },
            exchange_groups: table(&[
                (
                    "exchange_group_0",
                    vec!["vorname".into(), "nachname".into(), "geburtsname".into()],
                ),
                (
                    "exchange_group_1",
                    vec!["geburtstag".into(), "geburtsjahr".into(), "geburtsmonat".into()],
                ),
            ]),
            result_fields: None,
        }
    }
}

impl LinkageSettings {
    /// Parse user TOML, fill empty sections from the defaults and validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut settings: LinkageSettings = toml::from_str(s)?;
        settings.fill_empty_sections();
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }

    /// Empty tables count as absent.
    fn fill_empty_sections(&mut self) {
        let defaults = LinkageSettings::default();
        if self.patient_settings.is_empty() {
            self.patient_settings = defaults.patient_settings;
        }
        if self.matcher_frequency.is_empty() {
            self.matcher_frequency = defaults.matcher_frequency;
        }
        if self.matcher_error_rate.is_empty() {
            self.matcher_error_rate = defaults.matcher_error_rate;
        }
        if self.required_fields.is_empty() {
            self.required_fields = defaults.required_fields;
        }
        if self.validate_fields.is_empty() {
            self.validate_fields = defaults.validate_fields;
        }
        if self.validate_date.fields.is_empty() {
            self.validate_date = defaults.validate_date;
        }
        if self.exchange_groups.is_empty() {
            self.exchange_groups = defaults.exchange_groups;
        }
    }

    /// Every per-field table must cover the schema and only name schema fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let schema = &self.patient_settings;
        if schema.is_empty() {
            return Err(ConfigError::Invalid("patient_settings is empty".into()));
        }
        let tables: [(&str, Vec<&String>); 3] = [
            ("matcher_frequency", self.matcher_frequency.keys().collect()),
            ("matcher_error_rate", self.matcher_error_rate.keys().collect()),
            ("required_fields", self.required_fields.keys().collect()),
        ];
        for (name, keys) in &tables {
            if let Some(missing) = schema.keys().find(|f| !keys.contains(f)) {
                return Err(ConfigError::Invalid(format!("{name} has no entry for {missing}")));
            }
            if let Some(unknown) = keys.iter().find(|k| !schema.contains_key(k.as_str())) {
                return Err(ConfigError::Invalid(format!("{name} names unknown field {unknown}")));
            }
        }
        for (group, fields) in &self.exchange_groups {
            if let Some(unknown) = fields.iter().find(|f| !schema.contains_key(f.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "exchange group {group} names unknown field {unknown}"
                )));
            }
        }
        let unknown_validation = self
            .validate_fields
            .keys()
            .chain(self.validate_date.fields.iter())
            .find(|f| !schema.contains_key(f.as_str()));
        if let Some(unknown) = unknown_validation {
            return Err(ConfigError::Invalid(format!("validation names unknown field {unknown}")));
        }
        for (name, v) in [("is_match", self.thresholds.is_match), ("non_match", self.thresholds.non_match)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("threshold {name}={v} outside [0,1]")));
            }
        }
        Ok(())
    }

    /// Fields a node submits to its engine, in schema order.
    pub fn retained_fields(&self) -> Vec<String> {
        self.patient_settings.keys().cloned().collect()
    }

    /// Blinded fields read back per pseudonym.
    pub fn result_fields(&self) -> Vec<String> {
        match &self.result_fields {
            Some(fields) => fields.clone(),
            None => self
                .patient_settings
                .keys()
                .map(|f| format!("{f}_bigram_bloom"))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IdSettings {
    pub internal_id: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IdGenerator {
    pub generator: String,
    pub k1: u32,
    pub k2: u32,
    pub k3: u32,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerSettings {
    pub api_key: String,
    pub permissions: Vec<String>,
}

/// Deployment facts shared by both config variants: store location and the static credential.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineDeployment {
    pub database: DatabaseSettings,
    pub api_key: String,
}

impl Default for EngineDeployment {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url: "localhost:5432/app_db".into(),
                username: "app_user".into(),
                password: "change_me".into(),
            },
            api_key: "changeme1".into(),
        }
    }
}

/// The identifier type every submission and read uses.
pub const INTERNAL_ID_TYPE: &str = "pid";

/// Full document handed to one matching-engine instance.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub ids: IdSettings,
    pub id_generator: BTreeMap<String, IdGenerator>,
    pub database: DatabaseSettings,
    pub servers: Vec<ServerSettings>,
    #[serde(flatten)]
    pub settings: LinkageSettings,
    pub matcher_comparators: BTreeMap<String, Comparator>,
}

impl EngineConfig {
    fn build(
        settings: &LinkageSettings,
        deployment: &EngineDeployment,
        comparator: Comparator,
        salt: Option<String>,
    ) -> Self {
        let mut id_generator = BTreeMap::new();
        id_generator.insert(
            INTERNAL_ID_TYPE.to_string(),
            IdGenerator {
                generator: "PIDGenerator".into(),
                k1: 1,
                k2: 2,
                k3: 3,
            },
        );
        let permissions = [
            "createSession",
            "createToken",
            "tt_deletePatient",
            "tt_addPatient",
            "tt_readPatients",
            "tt_editPatient",
        ];
        Self {
            salt,
            ids: IdSettings {
                internal_id: INTERNAL_ID_TYPE.into(),
            },
            id_generator,
            database: deployment.database.clone(),
            servers: vec![ServerSettings {
                api_key: deployment.api_key.clone(),
                permissions: permissions.iter().map(|p| p.to_string()).collect(),
            }],
            settings: settings.clone(),
            matcher_comparators: settings
                .patient_settings
                .keys()
                .map(|f| (f.clone(), comparator))
                .collect(),
        }
    }

    /// Node-side variant: raw-string comparator plus the shared blinding salt.
    pub fn for_nodes(settings: &LinkageSettings, deployment: &EngineDeployment, salt: String) -> Self {
        Self::build(settings, deployment, Comparator::DiceCoefficientComparator, Some(salt))
    }

    /// Coordinator-side variant: bigram comparator, no salt.
    pub fn for_coordinator(settings: &LinkageSettings, deployment: &EngineDeployment) -> Self {
        Self::build(settings, deployment, Comparator::BloomFilterComparator, None)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Writes `config.toml` into `dir` and returns its path.
    pub fn write_toml(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = dir.join("config.toml");
        std::fs::write(&path, self.to_toml()?)?;
        Ok(path)
    }
}

/// 64 random bytes, hex encoded.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Per-process runtime knobs. Built from env.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    /// This process's own engine. The managed provision applies to it alone.
    pub engine_url: Option<String>,
    pub api_key: String,
    pub health: HealthPolicy,
    pub provision: EngineProvision,
    pub result_dir: PathBuf,
    pub linkage_config: Option<PathBuf>,
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

impl RuntimeSettings {
    /// `ENGINE_BINARY` set ⇒ the party whose engine is at `ENGINE_URL` manages
    /// the engine process itself (and the store when `PG_BIN_DIR` is set);
    /// every other engine is external.
    pub fn from_env() -> Self {
        let engine_url = std::env::var("ENGINE_URL").ok().filter(|u| !u.is_empty());
        let api_key = std::env::var("ENGINE_API_KEY").unwrap_or_else(|_| "changeme1".into());
        let health = HealthPolicy {
            timeout: env_secs("HEALTH_TIMEOUT_SECS", 60),
            interval: env_secs("HEALTH_INTERVAL_SECS", 2),
        };
        let provision = match std::env::var("ENGINE_BINARY") {
            Ok(binary) if !binary.is_empty() => {
                let store = std::env::var("PG_BIN_DIR").ok().map(|bin_dir| {
                    let data_dir = std::env::var("PG_DATA_DIR")
                        .unwrap_or_else(|_| "/var/lib/postgresql/data".into());
                    StoreControl::postgres(bin_dir, data_dir)
                });
                EngineProvision::Managed(ManagedEngine {
                    binary: PathBuf::from(binary),
                    store,
                    stop_grace: env_secs("ENGINE_STOP_GRACE_SECS", DEFAULT_STOP_GRACE.as_secs()),
                })
            }
            _ => EngineProvision::External,
        };
        let result_dir = std::env::var("RESULT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("linkage-results"));
        let linkage_config = std::env::var("LINKAGE_CONFIG").ok().map(PathBuf::from);
        Self {
            engine_url,
            api_key,
            health,
            provision,
            result_dir,
            linkage_config,
        }
    }

    /// Provision for the party whose engine is at `url`.
    ///
    /// Only the engine at `engine_url` is managed, and only for the first party
    /// that asks; `claimed` records that. Every other party gets
    /// [`EngineProvision::External`], so one store data dir is never started twice.
    pub fn provision_for(&self, url: &str, claimed: &mut bool) -> EngineProvision {
        let own = self
            .engine_url
            .as_deref()
            .is_some_and(|own| own.trim_end_matches('/') == url.trim_end_matches('/'));
        match &self.provision {
            EngineProvision::Managed(_) if own && !*claimed => {
                *claimed = true;
                self.provision.clone()
            }
            EngineProvision::Managed(_) if own => {
                warn!("engine at {} is already managed by another party; treating as external", url);
                EngineProvision::External
            }
            _ => EngineProvision::External,
        }
    }

    /// Settings from `LINKAGE_CONFIG` if set, defaults otherwise.
    pub fn linkage_settings(&self) -> Result<LinkageSettings, ConfigError> {
        match &self.linkage_config {
            Some(path) => LinkageSettings::load(path),
            None => Ok(LinkageSettings::default()),
        }
    }
}
