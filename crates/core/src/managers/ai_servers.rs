//! Management operations on AI-created servers.
//!
//! Every mutation goes validator → instance → manifest → process, so a
//! rejected request leaves disk and running processes untouched.

use super::manifest::{ManifestEntry, ManifestStore};
use super::supervisor::{ProcessSupervisor, Redeployed};
use crate::sandbox::CodeValidator;
use crate::validation::{
    validate_request, CreateServerRequest, EditServerRequest, ServerLogsRequest,
};
use chrono::Utc;
use kiln_shared::{
    Capabilities, KilnError, KilnResult, ServerDefinition, ServerStatus, ToolSchema,
    ValidationResult,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a successful `create`. The server exists even if `started`
/// holds an error.
#[derive(Debug)]
pub struct Created {
    pub definition: ServerDefinition,
    pub started: Option<KilnResult<Vec<ToolSchema>>>,
}

pub struct AiServers {
    manifest: ManifestStore,
    supervisor: Arc<ProcessSupervisor>,
    validator: CodeValidator,
    /// Operator switch: may servers be granted the network capability.
    allow_network: bool,
}

impl AiServers {
    #[must_use]
    pub fn new(
        manifest: ManifestStore,
        supervisor: Arc<ProcessSupervisor>,
        validator: CodeValidator,
        allow_network: bool,
    ) -> Self {
        Self {
            manifest,
            supervisor,
            validator,
            allow_network,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    fn validate(&self, source: &str, caps: Capabilities) -> KilnResult<ValidationResult> {
        match self.validator.validate(source, caps) {
            ValidationResult::Invalid(violations) => Err(KilnError::Validation(violations)),
            valid @ ValidationResult::Valid => Ok(valid),
        }
    }

    pub async fn create(&self, req: CreateServerRequest) -> KilnResult<Created> {
        validate_request(&req).map_err(KilnError::InvalidRequest)?;
        if self.manifest.contains(&req.name).await {
            return Err(KilnError::AlreadyExists(req.name));
        }

        let network = req.allow_network && self.allow_network;
        if req.allow_network && !self.allow_network {
            warn!(server = %req.name, "Network capability requested but disabled by operator");
        }
        let capabilities = Capabilities { network };
        let checked = self.validate(&req.code, capabilities)?;

        let now = Utc::now();
        let definition = ServerDefinition {
            id: req.name,
            description: req.description,
            source: req.code,
            capabilities,
            autostart: req.auto_start,
            created_at: now,
            modified_at: now,
            last_validated_at: now,
            validation: checked.to_status(now),
        };

        // The manifest insert reserves the id; a concurrent create of the same
        // name fails here before touching the instance directory.
        self.manifest
            .insert(ManifestEntry::from_definition(&definition))
            .await?;
        if let Err(e) = self.supervisor.builder().build(&definition) {
            error!(server = %definition.id, error = %format!("{e:#}"), "Failed to build sandbox instance");
            if let Err(undo) = self.manifest.remove(&definition.id).await {
                error!(server = %definition.id, error = %undo, "Failed to roll back manifest entry");
            }
            let _ = self.supervisor.builder().destroy(&definition.id);
            return Err(e.into());
        }
        info!(server = %definition.id, caps = %capabilities, "🛠️ Server created");

        let started = if definition.autostart {
            Some(self.supervisor.start(&definition).await)
        } else {
            None
        };
        Ok(Created {
            definition,
            started,
        })
    }

    /// Replace a server's source. Invalid source is rejected with the old
    /// version (and its process) untouched.
    pub async fn edit(&self, req: EditServerRequest) -> KilnResult<Redeployed> {
        validate_request(&req).map_err(KilnError::InvalidRequest)?;
        let entry = self
            .manifest
            .get(&req.name)
            .await
            .ok_or_else(|| KilnError::ServerNotFound(req.name.clone()))?;
        let checked = self.validate(&req.code, entry.capabilities)?;

        let now = Utc::now();
        let mut definition = entry.into_definition(req.code);
        definition.modified_at = now;
        definition.last_validated_at = now;
        definition.validation = checked.to_status(now);

        let outcome = self.supervisor.redeploy(&definition).await?;
        self.manifest
            .upsert(ManifestEntry::from_definition(&definition))
            .await?;
        info!(server = %definition.id, "✏️ Server updated");
        Ok(outcome)
    }

    /// Stop, then remove the instance directory and the manifest entry.
    pub async fn delete(&self, name: &str) -> KilnResult<()> {
        self.require(name).await?;
        self.supervisor.remove(name).await?;
        self.manifest.remove(name).await?;
        info!(server = %name, "🗑️ Server deleted");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> KilnResult<Vec<ToolSchema>> {
        let def = self.definition(name).await?;
        self.supervisor.start(&def).await
    }

    pub async fn stop(&self, name: &str) -> KilnResult<bool> {
        self.require(name).await?;
        self.supervisor.stop(name).await
    }

    pub async fn restart(&self, name: &str) -> KilnResult<Vec<ToolSchema>> {
        let def = self.definition(name).await?;
        self.supervisor.restart(&def).await
    }

    pub async fn list(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for entry in self.manifest.list().await {
            let info = self.supervisor.runtime_info(&entry.name).await;
            statuses.push(ServerStatus {
                id: entry.name,
                description: entry.description,
                state: info.state,
                capabilities: entry.capabilities,
                autostart: entry.autostart,
                tools: info.tools.into_iter().map(|t| t.name).collect(),
                pid: info.pid,
                started_at: info.started_at,
                last_error: info.last_error,
            });
        }
        statuses
    }

    pub async fn logs(&self, req: ServerLogsRequest) -> KilnResult<Vec<String>> {
        validate_request(&req).map_err(KilnError::InvalidRequest)?;
        self.require(&req.name).await?;
        Ok(self
            .supervisor
            .builder()
            .log_tail(&req.name, req.clamped_lines())?)
    }

    /// Start every autostart server concurrently. Failures are logged only.
    pub async fn boot_autostart(&self) {
        let ids = self.manifest.autostart_ids().await;
        if ids.is_empty() {
            return;
        }
        info!("Autostarting {} server(s)", ids.len());
        let starts = ids.iter().map(|id| self.start(id));
        let results = futures::future::join_all(starts).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!(server = %id, error = %e, "Autostart failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
    }

    async fn require(&self, name: &str) -> KilnResult<ManifestEntry> {
        self.manifest
            .get(name)
            .await
            .ok_or_else(|| KilnError::ServerNotFound(name.to_string()))
    }

    /// Manifest metadata joined with the current source. The source is
    /// re-validated so a definition is only runnable if what is on disk passes.
    async fn definition(&self, name: &str) -> KilnResult<ServerDefinition> {
        let entry = self.require(name).await?;
        let source = self.supervisor.builder().read_source(name).map_err(|e| {
            KilnError::ProcessStartFailure {
                id: name.to_string(),
                reason: format!("{e:#}"),
                log_tail: Vec::new(),
            }
        })?;
        let def = entry.into_definition(source);
        if def.is_runnable() {
            self.validate(&def.source, def.capabilities)?;
        }
        Ok(def)
    }
}
