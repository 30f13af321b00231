// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matching events against subscriptions.

use std::sync::Arc;

use super::store::SubscriptionStore;
use crate::error::StoreError;
use crate::event::{ChangeEvent, LifecycleEvent};
use crate::model::{
    ClientId, DefinitionLookup, Subscription, SubscriptionScope, SubscriptionType,
};
use crate::observe::{DeviceTransport, ObservationTracker};

/// Returns `true` if an observation subscription covers the change.
///
/// The client and object definition must match. An instance or property
/// filter, when set, must match as well.
#[must_use]
pub fn matches_change(subscription: &Subscription, event: &ChangeEvent) -> bool {
    if subscription.subscription_type != SubscriptionType::Observation {
        return false;
    }
    let SubscriptionScope::Resource {
        client_id,
        object_definition_id,
        instance_id,
        property_definition_id,
    } = &subscription.scope
    else {
        return false;
    };

    *client_id == event.client_id
        && *object_definition_id == event.object_definition_id
        && instance_id.is_none_or(|i| event.instance_id == Some(i))
        && property_definition_id.is_none_or(|p| event.changed_properties.contains(&p))
}

/// Finds the subscriptions interested in an event.
#[derive(Debug)]
pub struct SubscriptionMatcher<S: SubscriptionStore> {
    store: Arc<S>,
}

impl<S: SubscriptionStore> Clone for SubscriptionMatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SubscriptionStore> SubscriptionMatcher<S> {
    /// Creates a matcher over a store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Observation subscriptions covering a resource change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn match_change(&self, event: &ChangeEvent) -> Result<Vec<Subscription>, StoreError> {
        let candidates = self.store.for_client(event.client_id).await?;
        Ok(candidates
            .into_iter()
            .filter(|s| matches_change(s, event))
            .collect())
    }

    /// Lifecycle subscriptions of the event's organisation for its kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn match_lifecycle(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.store
            .lifecycle(event.organisation_id, event.kind.subscription_type())
            .await
    }

    /// Re-issues the observations behind a client's persisted subscriptions
    /// and returns how many are in place afterwards.
    ///
    /// Subscriptions whose definitions are unknown are skipped with a
    /// warning, as are observations the device refuses.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn rearm<T: DeviceTransport>(
        &self,
        client_id: ClientId,
        tracker: &ObservationTracker<T>,
        definitions: &dyn DefinitionLookup,
    ) -> Result<usize, StoreError> {
        let subscriptions = self.store.for_client(client_id).await?;
        let mut armed = 0;

        for subscription in subscriptions {
            let SubscriptionScope::Resource {
                object_definition_id,
                instance_id,
                property_definition_id,
                ..
            } = subscription.scope
            else {
                continue;
            };

            let Some(definition) =
                definitions.by_id(Some(subscription.organisation_id), object_definition_id)
            else {
                tracing::warn!(
                    client = %client_id,
                    subscription = %subscription.id,
                    definition = %object_definition_id,
                    "Unknown object definition, subscription not re-armed"
                );
                continue;
            };

            let property = match property_definition_id {
                Some(id) => match definition.property_by_id(id) {
                    Some(property) => Some(property.clone()),
                    None => {
                        tracing::warn!(
                            client = %client_id,
                            subscription = %subscription.id,
                            property = %id,
                            "Unknown property definition, subscription not re-armed"
                        );
                        continue;
                    }
                },
                None => None,
            };

            match tracker
                .observe(
                    definition,
                    instance_id,
                    property,
                    subscription.parameters.as_ref(),
                )
                .await
            {
                Ok(_) => armed += 1,
                Err(e) => {
                    tracing::warn!(
                        client = %client_id,
                        subscription = %subscription.id,
                        error = %e,
                        "Could not re-arm observation"
                    );
                }
            }
        }

        tracing::debug!(client = %client_id, armed, "Observations re-armed");
        Ok(armed)
    }
}
