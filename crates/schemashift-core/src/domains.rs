use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;

/// A bounded schema/data area with its own migration history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,

    /// Domains whose schema this domain references.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Tables covered by table-level backups.
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Ordered domain set plus static dependency graph.
///
/// Declaration order is the forward migration order. Every dependency must be
/// declared before its dependents, which makes the declaration order a
/// topological order and the graph acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DomainSpec>", into = "Vec<DomainSpec>")]
pub struct DomainCatalog {
    domains: Vec<DomainSpec>,
}

impl DomainCatalog {
    pub fn new(domains: Vec<DomainSpec>) -> Result<Self, PolicyError> {
        for (i, domain) in domains.iter().enumerate() {
            if domain.name.trim().is_empty() {
                return Err(PolicyError::InvalidCatalog("empty domain name".into()));
            }
            if domains[..i].iter().any(|d| d.name == domain.name) {
                return Err(PolicyError::InvalidCatalog(format!(
                    "duplicate domain '{}'",
                    domain.name
                )));
            }
            for dep in &domain.depends_on {
                if dep == &domain.name {
                    return Err(PolicyError::InvalidCatalog(format!(
                        "domain '{dep}' depends on itself"
                    )));
                }
                if !domains[..i].iter().any(|d| &d.name == dep) {
                    return Err(PolicyError::InvalidCatalog(format!(
                        "domain '{}' depends on '{dep}', which must be declared before it",
                        domain.name
                    )));
                }
            }
        }
        Ok(Self { domains })
    }

    /// The canonical catalog: `content`, then `services` (which references content).
    pub fn canonical() -> Self {
        Self {
            domains: vec![
                DomainSpec {
                    name: "content".into(),
                    depends_on: vec![],
                    tables: vec![
                        "articles".into(),
                        "media_assets".into(),
                        "categories".into(),
                        "tags".into(),
                    ],
                },
                DomainSpec {
                    name: "services".into(),
                    depends_on: vec!["content".into()],
                    tables: vec![
                        "service_listings".into(),
                        "service_providers".into(),
                        "bookings".into(),
                    ],
                },
            ],
        }
    }

    pub fn domains(&self) -> &[DomainSpec] {
        &self.domains
    }

    /// Domain names in forward migration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|d| d.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&DomainSpec> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.domains.iter().position(|d| d.name == name)
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.get(name).map(|d| d.depends_on.as_slice()).unwrap_or(&[])
    }

    /// Domains that directly depend on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.domains
            .iter()
            .filter(|d| d.depends_on.iter().any(|dep| dep == name))
            .map(|d| d.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Rollback order for a subset of domains: every domain comes after all
    /// domains that depend on it. Unknown names are dropped.
    ///
    /// Reverse declaration order satisfies this (including transitive
    /// dependencies through domains outside the subset), and doubles as the
    /// deterministic tie-break.
    pub fn rollback_order<'a, I>(&self, subset: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut positioned: Vec<(usize, &str)> = subset
            .into_iter()
            .filter_map(|name| self.position(name).map(|p| (p, name)))
            .collect();
        positioned.sort_by(|a, b| b.0.cmp(&a.0));
        positioned.dedup_by(|a, b| a.0 == b.0);
        positioned.into_iter().map(|(_, n)| n.to_string()).collect()
    }
}

impl Default for DomainCatalog {
    fn default() -> Self {
        Self::canonical()
    }
}

impl TryFrom<Vec<DomainSpec>> for DomainCatalog {
    type Error = PolicyError;

    fn try_from(domains: Vec<DomainSpec>) -> Result<Self, Self::Error> {
        Self::new(domains)
    }
}

impl From<DomainCatalog> for Vec<DomainSpec> {
    fn from(catalog: DomainCatalog) -> Self {
        catalog.domains
    }
}
