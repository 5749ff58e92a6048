//! Tenant partitioning.
//!
//! In `Single` mode every row belongs to the default tenant and tenancy is a
//! passthrough. In `Conjoined` mode all tenants share the tables and each
//! stream and event row is tagged with its tenant id.

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Tenant id used when multi-tenancy is off or no tenant was requested.
pub const DEFAULT_TENANT: &str = "*DEFAULT*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenancyStyle {
    #[default]
    Single,
    Conjoined,
}

/// Resolves the tenant for a unit of work.
#[derive(Debug, Clone)]
pub struct Tenancy {
    style: TenancyStyle,
    default_tenant: String,
}

impl Tenancy {
    pub fn new(style: TenancyStyle, default_tenant: impl Into<String>) -> Self {
        Self {
            style,
            default_tenant: default_tenant.into(),
        }
    }

    pub fn style(&self) -> TenancyStyle {
        self.style
    }

    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.style == TenancyStyle::Conjoined
    }

    /// Tenant id for a session or reader.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String> {
        match (self.style, requested) {
            (_, None) => Ok(self.default_tenant.clone()),
            (_, Some(tenant)) if tenant.trim().is_empty() => Err(StoreError::Configuration(
                "tenant id must not be empty".into(),
            )),
            (TenancyStyle::Single, Some(tenant)) if tenant != self.default_tenant => {
                Err(StoreError::Configuration(format!(
                    "tenant '{tenant}' requested but the store is single-tenant"
                )))
            }
            (_, Some(tenant)) => Ok(tenant.to_string()),
        }
    }

    /// Tenant filter for reads; `None` means no filtering.
    pub fn read_filter<'a>(&self, tenant: &'a str) -> Option<&'a str> {
        match self.style {
            TenancyStyle::Single => None,
            TenancyStyle::Conjoined => Some(tenant),
        }
    }
}

impl Default for Tenancy {
    fn default() -> Self {
        Self::new(TenancyStyle::Single, DEFAULT_TENANT)
    }
}
