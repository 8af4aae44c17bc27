use log::{debug, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for resolving noisy extracted street-name tokens against
/// the gazetteer.
#[derive(Debug, Clone)]
pub struct NameResolverConfig {
    /// Minimum normalized edit-distance ratio for the strict similarity
    /// pass.
    pub similarity_threshold: f64,
    /// Tokens that mark route topology (u-turns, roundabouts) rather than
    /// streets. They resolve to an empty candidate set.
    pub skip_markers: Vec<String>,
    /// Street-type prefixes tried in front of the stripped token.
    pub street_type_prefixes: Vec<String>,
}

impl Default for NameResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            skip_markers: vec![
                "vuelta en u".to_string(),
                "retorno".to_string(),
                "glorieta".to_string(),
            ],
            street_type_prefixes: vec![
                "cerrada".to_string(),
                "calzada".to_string(),
                "avenida".to_string(),
                "calle".to_string(),
                "prolongacion".to_string(),
                "carretera".to_string(),
            ],
        }
    }
}

/// The plausible real street names for one extracted token.
///
/// An empty set is valid: skip markers and genuinely unresolvable tokens
/// both produce one, and downstream stages treat it as a break in evidence
/// rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameCandidateSet {
    pub token: String,
    pub candidates: Vec<String>,
}

impl NameCandidateSet {
    pub fn empty(token: &str) -> Self {
        Self {
            token: token.to_string(),
            candidates: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Resolves extracted street-name tokens to gazetteer entries.
///
/// Tokens arrive already lower-cased and abbreviation-expanded by the text
/// cleanup collaborator; this stage only has to absorb OCR noise and
/// partial mentions.
pub struct NameResolver {
    gazetteer: Vec<String>,
    config: NameResolverConfig,
}

impl NameResolver {
    pub fn new(gazetteer: Vec<String>, config: NameResolverConfig) -> Self {
        Self { gazetteer, config }
    }

    /// Resolve every token of one leg, preserving order. Skip markers and
    /// unresolved tokens yield empty sets in place.
    pub fn resolve_leg(&self, tokens: &[String]) -> Vec<NameCandidateSet> {
        tokens.iter().map(|t| self.resolve(t)).collect()
    }

    /// Resolve a single token to its candidate street names.
    pub fn resolve(&self, token: &str) -> NameCandidateSet {
        let token = token.trim().to_lowercase();

        if self.is_skip_marker(&token) {
            debug!("Skipping route-topology marker {token:?}");
            return NameCandidateSet::empty(&token);
        }

        let variants = self.build_variants(&token);

        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for street in &self.gazetteer {
            let folded_street = fold_diacritics(street);
            for variant in &variants {
                let folded_variant = fold_diacritics(variant);
                let similar = strsim::normalized_levenshtein(&folded_variant, &folded_street)
                    >= self.config.similarity_threshold;
                if (similar || folded_street.contains(&folded_variant))
                    && seen.insert(street.clone())
                {
                    candidates.push(street.clone());
                    break;
                }
            }
        }

        if candidates.is_empty() {
            // Audit trail for spec'd UnresolvedToken: non-fatal, the empty
            // set flows on.
            warn!("{}", Error::UnresolvedToken(token.clone()));
        }

        NameCandidateSet { token, candidates }
    }

    /// Whether a token is a route-topology marker rather than a street.
    pub fn is_skip_marker(&self, token: &str) -> bool {
        token.contains("base")
            || self
                .config
                .skip_markers
                .iter()
                .any(|marker| token == marker)
    }

    /// The set of name variants checked against each gazetteer entry: the
    /// raw token, the prefix-stripped base, each street-type prefix
    /// prepended to the base, and the whole-corpus nearest entry by term
    /// cosine similarity (recovers tokens assembled from multiple
    /// fragments).
    fn build_variants(&self, token: &str) -> Vec<String> {
        let base = self.strip_prefixes(token);

        let mut variants = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |v: String, variants: &mut Vec<String>| {
            if !v.is_empty() && seen.insert(v.clone()) {
                variants.push(v);
            }
        };

        for prefix in &self.config.street_type_prefixes {
            push(format!("{prefix} {base}"), &mut variants);
        }
        if token.split_whitespace().count() > 1 {
            push(token.to_string(), &mut variants);
        }
        if base.split_whitespace().count() > 1 {
            push(base.clone(), &mut variants);
        }
        if let Some(nearest) = cosine_nearest(token, &self.gazetteer) {
            push(nearest.trim().to_lowercase(), &mut variants);
        }

        variants
    }

    /// Remove street-type prefixes anywhere they appear as whole words.
    fn strip_prefixes(&self, token: &str) -> String {
        token
            .split_whitespace()
            .filter(|word| {
                !self
                    .config
                    .street_type_prefixes
                    .iter()
                    .any(|p| p.as_str() == *word)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Fold Spanish diacritics to their ASCII base letters.
pub fn fold_diacritics(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'Á' | 'À' | 'Ä' | 'Â' => 'A',
            'É' | 'È' | 'Ë' | 'Ê' => 'E',
            'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
            'Ó' | 'Ò' | 'Ö' | 'Ô' => 'O',
            'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
            'Ñ' => 'N',
            _ => c,
        })
        .collect()
}

/// Nearest corpus entry to `target` by cosine similarity over
/// term-frequency vectors built across the target plus the whole corpus.
fn cosine_nearest(target: &str, corpus: &[String]) -> Option<String> {
    if corpus.is_empty() {
        return None;
    }

    // Vocabulary over all documents
    let mut vocabulary: HashMap<&str, usize> = HashMap::new();
    for doc in std::iter::once(target).chain(corpus.iter().map(String::as_str)) {
        for term in doc.split_whitespace() {
            let next = vocabulary.len();
            vocabulary.entry(term).or_insert(next);
        }
    }
    if vocabulary.is_empty() {
        return None;
    }

    let vectorize = |doc: &str| -> Array1<f64> {
        let mut v = Array1::zeros(vocabulary.len());
        for term in doc.split_whitespace() {
            if let Some(&idx) = vocabulary.get(term) {
                v[idx] += 1.0;
            }
        }
        v
    };

    let target_vec = vectorize(target);
    let target_norm = target_vec.dot(&target_vec).sqrt();
    if target_norm == 0.0 {
        return None;
    }

    // Entries sharing no term with the target score 0.0 and are never
    // "nearest": a zero-similarity pick would smuggle an arbitrary street
    // into every candidate set.
    let mut best: Option<(f64, &String)> = None;
    for entry in corpus {
        let v = vectorize(entry);
        let norm = v.dot(&v).sqrt();
        if norm == 0.0 {
            continue;
        }
        let similarity = target_vec.dot(&v) / (target_norm * norm);
        if similarity <= 0.0 {
            continue;
        }
        match best {
            Some((best_similarity, _)) if similarity <= best_similarity => {}
            _ => best = Some((similarity, entry)),
        }
    }

    best.map(|(_, entry)| entry.clone())
}

/// Configuration for the optional remote gazetteer collaborator.
#[derive(Debug, Clone)]
pub struct RemoteGazetteerConfig {
    /// Base URL of a Nominatim-style street search endpoint.
    pub endpoint: String,
    /// City appended to every query.
    pub city: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Attempts before giving up on a lookup.
    pub max_attempts: u32,
    /// Base backoff between attempts; grows linearly with the attempt
    /// number.
    pub retry_backoff: Duration,
}

impl Default for RemoteGazetteerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            city: "Mexico City".to_string(),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteStreet {
    name: Option<String>,
}

/// Remote street-name lookup behind the narrow `resolve(name)` interface.
///
/// Lookups are retried with backoff up to the configured attempt count and
/// then degrade to an empty result: a missing remote answer weakens one
/// candidate set, it never aborts the run.
pub struct RemoteGazetteer {
    client: reqwest::Client,
    config: RemoteGazetteerConfig,
}

impl RemoteGazetteer {
    pub fn new(config: RemoteGazetteerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::GazetteerUnavailable {
                attempts: 0,
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    /// Resolve a street name to the distinct names the remote service
    /// knows it by.
    pub async fn resolve(&self, name: &str) -> Result<Vec<String>> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.request(name).await {
                Ok(names) => return Ok(names),
                Err(reason) => {
                    warn!(
                        "Gazetteer lookup for {name:?} failed (attempt {attempt}/{}): {reason}",
                        self.config.max_attempts
                    );
                    last_error = reason;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }

        Err(Error::GazetteerUnavailable {
            attempts: self.config.max_attempts,
            reason: last_error,
        })
    }

    /// Like [`resolve`](Self::resolve), but degrades to an empty candidate
    /// list once retries are exhausted.
    pub async fn resolve_or_empty(&self, name: &str) -> Vec<String> {
        match self.resolve(name).await {
            Ok(names) => names,
            Err(e) => {
                warn!("{e}; degrading {name:?} to empty resolution");
                Vec::new()
            }
        }
    }

    async fn request(&self, name: &str) -> std::result::Result<Vec<String>, String> {
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("street", name),
                ("city", self.config.city.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        let results: Vec<RemoteStreet> = response.json().await.map_err(|e| e.to_string())?;

        let mut names = Vec::new();
        let mut seen = HashSet::new();
        for result in results {
            if let Some(name) = result.name {
                let name = name.trim().to_lowercase();
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}
