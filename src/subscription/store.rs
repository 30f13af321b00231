// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription persistence boundary.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::model::{ClientId, OrganisationId, Subscription, SubscriptionId, SubscriptionType};

/// Read/write access to persisted subscriptions.
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Loads one subscription.
    fn get(
        &self,
        id: SubscriptionId,
    ) -> impl Future<Output = Result<Option<Subscription>, StoreError>> + Send;

    /// Loads the observation subscriptions of a client.
    fn for_client(
        &self,
        client_id: ClientId,
    ) -> impl Future<Output = Result<Vec<Subscription>, StoreError>> + Send;

    /// Loads the lifecycle subscriptions of an organisation with the given
    /// type.
    fn lifecycle(
        &self,
        organisation_id: OrganisationId,
        subscription_type: SubscriptionType,
    ) -> impl Future<Output = Result<Vec<Subscription>, StoreError>> + Send;

    /// Inserts or replaces a subscription.
    fn save(&self, subscription: Subscription)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes a subscription. Returns `false` if it did not exist.
    fn delete(&self, id: SubscriptionId) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// In-memory [`SubscriptionStore`].
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl InMemorySubscriptionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().get(&id).cloned())
    }

    async fn for_client(&self, client_id: ClientId) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.client_id() == Some(client_id))
            .cloned()
            .collect())
    }

    async fn lifecycle(
        &self,
        organisation_id: OrganisationId,
        subscription_type: SubscriptionType,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .values()
            .filter(|s| {
                s.organisation_id == organisation_id && s.subscription_type == subscription_type
            })
            .cloned()
            .collect())
    }

    async fn save(&self, subscription: Subscription) -> Result<(), StoreError> {
        subscription.validate()?;
        self.subscriptions
            .write()
            .insert(subscription.id, subscription);
        Ok(())
    }

    async fn delete(&self, id: SubscriptionId) -> Result<bool, StoreError> {
        Ok(self.subscriptions.write().remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::model::SubscriptionScope;

    #[tokio::test]
    async fn crud() {
        let store = InMemorySubscriptionStore::new();
        let client = ClientId::new();
        let sub = Subscription::observation(OrganisationId::new(1), client, Uuid::new_v4(), "http://a");
        let id = sub.id;

        store.save(sub.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(sub));
        assert_eq!(store.for_client(client).await.unwrap().len(), 1);
        assert!(store.for_client(ClientId::new()).await.unwrap().is_empty());

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_filters_by_org_and_type() {
        let store = InMemorySubscriptionStore::new();
        let org = OrganisationId::new(1);
        store
            .save(Subscription::lifecycle(org, SubscriptionType::ClientConnected, "http://a"))
            .await
            .unwrap();
        store
            .save(Subscription::lifecycle(org, SubscriptionType::ClientDisconnected, "http://b"))
            .await
            .unwrap();
        store
            .save(Subscription::lifecycle(
                OrganisationId::new(2),
                SubscriptionType::ClientConnected,
                "http://c",
            ))
            .await
            .unwrap();

        let found = store
            .lifecycle(org, SubscriptionType::ClientConnected)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].url, "http://a");
    }

    #[tokio::test]
    async fn save_rejects_inconsistent_scope() {
        let store = InMemorySubscriptionStore::new();
        let mut sub = Subscription::lifecycle(
            OrganisationId::new(1),
            SubscriptionType::ClientConnected,
            "http://a",
        );
        sub.scope = SubscriptionScope::Resource {
            client_id: ClientId::new(),
            object_definition_id: Uuid::new_v4(),
            instance_id: None,
            property_definition_id: None,
        };
        assert!(matches!(
            store.save(sub).await,
            Err(StoreError::InvalidRecord { .. })
        ));
        assert_eq!(store.len(), 0);
    }
}
