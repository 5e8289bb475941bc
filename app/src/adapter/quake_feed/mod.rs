use std::sync::Arc;

use coordinator::{
    FeedEntityManager, FeedEntry, FeedEvent, FeedManagerOptions, FeedSource, UpdateError,
};
use infrastructure::{EventEmitter, HttpClientConfig};
use serde::{Deserialize, Serialize};
use support::ext::ResultExt;
use support::time::{DateTime, Duration};

use crate::entity::EntityStateEvent;
use crate::registry::{ConfigEntry, LoadedEntry, SetupError};

#[derive(Debug, Deserialize, Clone)]
pub struct QuakeFeedSettings {
    pub url: String,
    #[serde(default = "default_update_interval")]
    pub update_interval: Duration,
    #[serde(default)]
    pub min_magnitude: f64,
}

fn default_update_interval() -> Duration {
    Duration::minutes(5)
}

/// One earthquake as the sensors show it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quake {
    pub magnitude: f64,
    pub locality: String,
    pub longitude: f64,
    pub latitude: f64,
    pub depth_km: Option<f64>,
}

//GeoJSON shapes of the public feed, reduced to what the sensors need
#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
    geometry: FeatureGeometry,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    #[serde(rename = "publicID")]
    public_id: String,
    magnitude: f64,
    locality: String,
    #[serde(default)]
    depth: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FeatureGeometry {
    coordinates: Vec<f64>,
}

pub struct QuakeFeedSource {
    client: reqwest::Client,
    url: String,
    min_magnitude: f64,
}

impl FeedSource for QuakeFeedSource {
    type Attributes = Quake;

    async fn fetch_entries(&self) -> Result<Vec<FeedEntry<Quake>>, UpdateError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(super::classify_http_error)?;

        let collection: FeatureCollection = response
            .json()
            .await
            .map_err(|e| UpdateError::unexpected(anyhow::anyhow!("malformed quake feed: {e}")))?;

        Ok(parse_features(collection, self.min_magnitude))
    }
}

fn parse_features(collection: FeatureCollection, min_magnitude: f64) -> Vec<FeedEntry<Quake>> {
    collection
        .features
        .into_iter()
        .filter_map(|feature| {
            to_entry(feature)
                .map(Some)
                .unwrap_or_warn(None, "Skipping malformed quake feature")
        })
        .filter(|entry| entry.attributes.magnitude >= min_magnitude)
        .collect()
}

fn to_entry(feature: Feature) -> anyhow::Result<FeedEntry<Quake>> {
    let &[longitude, latitude, ..] = feature.geometry.coordinates.as_slice() else {
        anyhow::bail!(
            "feature {} has no usable coordinates",
            feature.properties.public_id
        );
    };

    Ok(FeedEntry {
        external_id: feature.properties.public_id,
        attributes: Quake {
            magnitude: feature.properties.magnitude,
            locality: feature.properties.locality,
            longitude,
            latitude,
            depth_km: feature.properties.depth,
        },
    })
}

impl QuakeFeedSettings {
    /// Loads the quake feed entry: feed manager, one sensor per live
    /// quake, plus a status sensor fed from the diagnostic record.
    pub async fn setup(
        &self,
        entry: ConfigEntry,
        events: EventEmitter<EntityStateEvent>,
    ) -> Result<LoadedEntry, SetupError> {
        let client = HttpClientConfig::new(None)
            .new_client()
            .map_err(SetupError::Failed)?;

        let source = QuakeFeedSource {
            client,
            url: self.url.clone(),
            min_magnitude: self.min_magnitude,
        };

        let manager = FeedEntityManager::new(
            format!("quake feed {}", entry.id),
            source,
            FeedManagerOptions {
                update_interval: self.update_interval,
                fetch_timeout: Duration::seconds(30),
            },
        );

        let quake_events = events.clone();
        let quake_manager = Arc::downgrade(&manager);
        let entry_id = entry.id.clone();
        let quake_listener = manager.add_listener(move |event| {
            let Some(manager) = quake_manager.upgrade() else {
                return Ok(());
            };

            quake_events.send(match event {
                FeedEvent::EntryAdded(id) | FeedEvent::EntryUpdated(id) => {
                    quake_state(&entry_id, &manager, id)
                }
                FeedEvent::EntryRemoved(id) => retired_quake(&entry_id, id),
            });
            Ok(())
        });

        let status_events = events;
        let status_id = format!("{}_status", entry.id);
        let status_listener = manager.add_status_listener(move |status| {
            status_events.send(EntityStateEvent {
                entity_id: status_id.clone(),
                state: Some(status.status.to_string()),
                available: true,
                updated_at: DateTime::now(),
            });
            Ok(())
        });

        //a failing first update is tolerated: the feed starts empty and
        //recovers on its schedule
        manager.start().await;

        let teardown = Box::pin(async move {
            drop(quake_listener);
            drop(status_listener);
            manager.shutdown();
        });

        Ok(LoadedEntry::new(entry, teardown))
    }
}

fn quake_state(
    entry_id: &str,
    manager: &FeedEntityManager<QuakeFeedSource>,
    external_id: &str,
) -> EntityStateEvent {
    let state = manager
        .entry(external_id)
        .map(|quake| format!("M{:.1} {}", quake.magnitude, quake.locality));

    EntityStateEvent {
        entity_id: quake_entity_id(entry_id, external_id),
        available: state.is_some(),
        state,
        updated_at: DateTime::now(),
    }
}

fn retired_quake(entry_id: &str, external_id: &str) -> EntityStateEvent {
    EntityStateEvent {
        entity_id: quake_entity_id(entry_id, external_id),
        state: None,
        available: false,
        updated_at: DateTime::now(),
    }
}

fn quake_entity_id(entry_id: &str, external_id: &str) -> String {
    format!("{}_quake_{}", entry_id, external_id)
}
