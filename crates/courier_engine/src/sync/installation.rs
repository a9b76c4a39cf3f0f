//! Installation registration and profile patches.

use super::{notify, ListenerSlot, ResultListener, SyncContext, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::model::{AttributeValue, Installation, InstallationPatch};
use crate::runner::RetryableTask;
use crate::throttle::SyncThrottle;
use crate::transport::CreateInstallationRequest;
use courier_storage::KeyValueStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Store key of the persisted local installation.
pub const INSTALLATION_KEY: &str = "installation";
const THROTTLE_KEY: &str = "last_sync.installation";

/// The local installation plus markers for fields the backend has not seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LocalInstallation {
    installation: Installation,
    unreported_push_token: bool,
    unreported_primary_device: bool,
    unreported_attributes: BTreeSet<String>,
}

impl LocalInstallation {
    /// Builds a patch from the unreported fields only.
    fn pending_patch(&self, include_token: bool) -> InstallationPatch {
        let installation = &self.installation;
        InstallationPatch {
            push_token: if self.unreported_push_token || include_token {
                installation.push_token.clone()
            } else {
                None
            },
            is_primary_device: self
                .unreported_primary_device
                .then_some(installation.is_primary_device),
            custom_attributes: self
                .unreported_attributes
                .iter()
                .map(|key| (key.clone(), installation.custom_attributes.get(key).cloned()))
                .collect(),
        }
    }

    /// Clears markers for sent fields whose local value has not changed
    /// since.
    fn acknowledge(&mut self, sent: &InstallationPatch) {
        let installation = &self.installation;
        if sent.push_token.is_some() && sent.push_token == installation.push_token {
            self.unreported_push_token = false;
        }
        if sent.is_primary_device == Some(installation.is_primary_device) {
            self.unreported_primary_device = false;
        }
        for (key, value) in &sent.custom_attributes {
            if installation.custom_attributes.get(key) == value.as_ref() {
                self.unreported_attributes.remove(key);
            }
        }
    }
}

/// Persisted local installation, shared by every synchronizer that needs
/// the registration id.
pub struct InstallationState {
    store: Arc<dyn KeyValueStore>,
    local: Mutex<LocalInstallation>,
}

impl std::fmt::Debug for InstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationState")
            .field("local", &*self.local.lock())
            .finish_non_exhaustive()
    }
}

impl InstallationState {
    /// Loads the installation from `store`, or starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the stored record is
    /// corrupted.
    pub fn load(store: Arc<dyn KeyValueStore>) -> SyncResult<Self> {
        let local = match store.get_value(INSTALLATION_KEY)? {
            Some(bytes) => ciborium::from_reader(bytes.as_slice())
                .map_err(|e| SyncError::Codec(e.to_string()))?,
            None => LocalInstallation::default(),
        };
        Ok(Self {
            store,
            local: Mutex::new(local),
        })
    }

    /// Returns a copy of the local installation.
    pub fn snapshot(&self) -> Installation {
        self.local.lock().installation.clone()
    }

    /// Returns the server-assigned registration id, if any.
    pub fn registration_id(&self) -> Option<String> {
        self.local.lock().installation.registration_id.clone()
    }

    /// Adopts a registration id obtained outside the engine.
    pub fn set_registration_id(&self, registration_id: impl Into<String>) -> SyncResult<()> {
        let registration_id = registration_id.into();
        self.update(|local| local.installation.registration_id = Some(registration_id))
    }

    /// Returns true if any field has not been reported yet.
    pub fn has_unreported_changes(&self) -> bool {
        let local = self.local.lock();
        local.unreported_push_token
            || local.unreported_primary_device
            || !local.unreported_attributes.is_empty()
    }

    /// Decides between create and patch. `None` when neither is possible.
    fn pending_work(&self) -> Option<(bool, InstallationPatch)> {
        let local = self.local.lock();
        match (
            &local.installation.registration_id,
            &local.installation.push_token,
        ) {
            (Some(_), _) => Some((false, local.pending_patch(false))),
            (None, Some(_)) => Some((true, local.pending_patch(true))),
            (None, None) => None,
        }
    }

    fn update<R>(&self, change: impl FnOnce(&mut LocalInstallation) -> R) -> SyncResult<R> {
        let mut local = self.local.lock();
        let mut next = local.clone();
        let out = change(&mut next);

        if next != *local {
            let mut bytes = Vec::new();
            ciborium::into_writer(&next, &mut bytes)
                .map_err(|e| SyncError::Codec(e.to_string()))?;
            self.store.set_value(INSTALLATION_KEY, bytes)?;
            *local = next;
        }
        Ok(out)
    }
}

/// Keeps the backend's view of this installation up to date.
///
/// Without a registration id the first sync registers the installation;
/// afterwards every sync sends a patch carrying only fields changed since
/// the last successful report.
pub struct InstallationSynchronizer {
    ctx: SyncContext,
    state: Arc<InstallationState>,
    throttle: Arc<SyncThrottle>,
}

impl std::fmt::Debug for InstallationSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationSynchronizer")
            .field("state", &self.state)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl InstallationSynchronizer {
    /// Creates a synchronizer over `state`.
    pub fn new(ctx: SyncContext, state: Arc<InstallationState>) -> Self {
        let throttle = Arc::new(SyncThrottle::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.clock),
            THROTTLE_KEY,
            ctx.config.throttle_window,
        ));
        Self {
            ctx,
            state,
            throttle,
        }
    }

    /// The shared local installation.
    pub fn state(&self) -> &Arc<InstallationState> {
        &self.state
    }

    /// Returns a copy of the local installation.
    pub fn installation(&self) -> Installation {
        self.state.snapshot()
    }

    /// Records a new push token.
    pub fn set_push_token(&self, push_token: impl Into<String>) -> SyncResult<()> {
        let push_token = push_token.into();
        self.state.update(|local| {
            if local.installation.push_token.as_deref() != Some(push_token.as_str()) {
                local.installation.push_token = Some(push_token);
                local.unreported_push_token = true;
            }
        })
    }

    /// Records the primary-device flag.
    pub fn set_primary_device(&self, primary: bool) -> SyncResult<()> {
        self.state.update(|local| {
            if local.installation.is_primary_device != primary {
                local.installation.is_primary_device = primary;
                local.unreported_primary_device = true;
            }
        })
    }

    /// Sets a custom attribute.
    pub fn set_custom_attribute(
        &self,
        key: impl Into<String>,
        value: AttributeValue,
    ) -> SyncResult<()> {
        let key = key.into();
        self.state.update(|local| {
            if local.installation.custom_attributes.get(&key) != Some(&value) {
                local.installation.custom_attributes.insert(key.clone(), value);
                local.unreported_attributes.insert(key);
            }
        })
    }

    /// Removes a custom attribute; the next patch deletes it on the server.
    pub fn remove_custom_attribute(&self, key: &str) -> SyncResult<()> {
        self.state.update(|local| {
            if local.installation.custom_attributes.remove(key).is_some() {
                local.unreported_attributes.insert(key.to_string());
            }
        })
    }

    /// Background reconciliation under the background policy.
    pub fn sync(&self, listener: Option<ResultListener<Installation>>) {
        self.run(SyncMode::Background, listener);
    }

    /// User-triggered save under the foreground policy.
    pub fn save(&self, listener: Option<ResultListener<Installation>>) {
        self.run(SyncMode::Foreground, listener);
    }

    fn run(&self, mode: SyncMode, listener: Option<ResultListener<Installation>>) {
        if !self.throttle.try_begin(mode.respects_window()) {
            notify(listener, Ok(self.state.snapshot()));
            return;
        }

        let Some((create, patch)) = self.state.pending_work() else {
            self.throttle.abort();
            tracing::debug!("no registration id and no push token");
            notify(listener, Err(SyncError::NoValidRegistration));
            return;
        };

        if !create && patch.is_empty() {
            self.throttle.abort();
            tracing::debug!("installation up to date");
            notify(listener, Ok(self.state.snapshot()));
            return;
        }

        let task = Arc::new(InstallationTask {
            ctx: self.ctx.clone(),
            state: Arc::clone(&self.state),
            throttle: Arc::clone(&self.throttle),
            create,
            listener: ListenerSlot::new(listener),
        });
        self.ctx
            .runner
            .execute(task, vec![patch], self.ctx.policy(mode));
    }
}

struct InstallationTask {
    ctx: SyncContext,
    state: Arc<InstallationState>,
    throttle: Arc<SyncThrottle>,
    create: bool,
    listener: ListenerSlot<Installation>,
}

impl InstallationTask {
    fn fail(&self, error: SyncError) {
        self.ctx.broadcaster.error(&error);
        self.listener.fire(Err(error));
    }
}

impl RetryableTask for InstallationTask {
    type Item = InstallationPatch;
    /// Registration id, when one was created.
    type Output = Option<String>;

    fn run(&self, items: &[InstallationPatch]) -> SyncResult<Option<String>> {
        let patch = items.first().cloned().unwrap_or_default();

        if self.create {
            let push_token = patch
                .push_token
                .clone()
                .ok_or(SyncError::NoValidRegistration)?;
            let response = self
                .ctx
                .backend
                .create_installation(&CreateInstallationRequest { push_token, patch })?;
            return Ok(Some(response.registration_id));
        }

        let registration_id = self
            .state
            .registration_id()
            .ok_or(SyncError::NoValidRegistration)?;
        self.ctx
            .backend
            .patch_installation(&registration_id, &patch)?;
        Ok(None)
    }

    fn after(&self, items: Vec<InstallationPatch>, created: Option<String>) {
        let sent = items.into_iter().next().unwrap_or_default();
        let updated = self.state.update(|local| {
            if let Some(registration_id) = &created {
                local.installation.registration_id = Some(registration_id.clone());
            }
            local.acknowledge(&sent);
            local.installation.clone()
        });
        self.throttle.finish();

        match updated {
            Ok(installation) => {
                if let (Some(registration_id), Some(push_token)) = (&created, &sent.push_token) {
                    tracing::info!(registration_id = %registration_id, "installation registered");
                    self.ctx
                        .broadcaster
                        .registration_created(push_token, registration_id);
                } else {
                    tracing::info!("installation patched");
                }
                self.ctx.broadcaster.installation_updated(&installation);
                self.listener.fire(Ok(installation));
            }
            Err(e) => self.fail(e),
        }
    }

    fn error(&self, _items: Vec<InstallationPatch>, error: SyncError) {
        self.throttle.finish();
        self.fail(error);
    }

    fn should_cancel(&self) -> bool {
        self.create && self.state.registration_id().is_some()
    }

    fn cancelled(&self, _items: Vec<InstallationPatch>) {
        self.throttle.abort();
        if self.should_cancel() {
            tracing::debug!("registration id appeared, create skipped");
            self.listener.fire(Ok(self.state.snapshot()));
        } else {
            self.listener.fire(Err(SyncError::Cancelled));
        }
    }
}
