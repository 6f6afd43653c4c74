//! Backend selection

use std::sync::Arc;

use certwarden_common::crd::{GenericIssuer, IssuerType};

use crate::acme::AcmeBackend;
use crate::ca::CaBackend;
use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::selfsigned::SelfSignedBackend;
use crate::vault::VaultBackend;
use crate::venafi::VenafiBackend;
use crate::IssuerBackend;

/// Builds the backend for an issuer
pub trait BackendFactory: Send + Sync {
    /// Backend for `issuer`; fails if its configuration names no single backend
    fn backend_for(&self, issuer: &GenericIssuer) -> Result<Arc<dyn IssuerBackend>, IssuerError>;
}

/// Factory building the built-in backends over one shared context
#[derive(Clone)]
pub struct IssuerFactory {
    ctx: IssuerContext,
}

impl IssuerFactory {
    /// Factory over `ctx`
    pub fn new(ctx: IssuerContext) -> Self {
        Self { ctx }
    }

    /// Shared context
    pub fn context(&self) -> &IssuerContext {
        &self.ctx
    }
}

impl BackendFactory for IssuerFactory {
    fn backend_for(&self, issuer: &GenericIssuer) -> Result<Arc<dyn IssuerBackend>, IssuerError> {
        let config = issuer.config();
        let missing = || IssuerError::validation("issuer backend block disappeared");
        let backend: Arc<dyn IssuerBackend> = match issuer
            .issuer_type()
            .map_err(|e| IssuerError::validation(e.to_string()))?
        {
            IssuerType::Acme => Arc::new(AcmeBackend::new(
                self.ctx.clone(),
                issuer.clone(),
                config.acme.clone().ok_or_else(missing)?,
            )),
            IssuerType::Ca => Arc::new(CaBackend::new(
                self.ctx.clone(),
                issuer.clone(),
                config.ca.clone().ok_or_else(missing)?,
            )),
            IssuerType::SelfSigned => {
                Arc::new(SelfSignedBackend::new(self.ctx.clone(), issuer.clone()))
            }
            IssuerType::Vault => Arc::new(VaultBackend::new(
                self.ctx.clone(),
                issuer.clone(),
                config.vault.clone().ok_or_else(missing)?,
            )),
            IssuerType::Venafi => Arc::new(VenafiBackend::new(
                self.ctx.clone(),
                issuer.clone(),
                config.venafi.clone().ok_or_else(missing)?,
            )?),
        };
        Ok(backend)
    }
}
