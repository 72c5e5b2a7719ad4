//! Observable Properties
//!
//! Property values mirrored from the camera into the client-facing model.
//! Each [`Observable`] wraps a `tokio::sync::watch` channel so the framework,
//! loggers and tests can all follow the value without polling.
//!
//! # Example
//!
//! ```rust,ignore
//! let gain = Observable::new("Gain", 100_i64).with_range(0, 600);
//!
//! let mut rx = gain.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         tracing::info!(gain = *rx.borrow(), "gain changed");
//!     }
//! });
//!
//! gain.set(250)?;
//! assert!(gain.set(700).is_err()); // outside [0, 600], value unchanged
//! ```

use crate::error::{CameraError, CameraResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// PropertyBase - type-erased access
// =============================================================================

/// Type-erased access to a property, used when the framework walks the whole
/// catalog (definition, snapshots) without knowing each value type.
pub trait PropertyBase: Send + Sync {
    fn name(&self) -> &str;

    /// Current value as JSON.
    fn get_json(&self) -> CameraResult<serde_json::Value>;

    fn metadata(&self) -> &PropertyMetadata;

    fn as_any(&self) -> &dyn Any;
}

/// Metadata describing a property to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyMetadata {
    /// Property name (unique within the catalog).
    pub name: String,
    /// Human-readable label.
    pub label: Option<String>,
    /// Group the client shows the property under.
    pub group: Option<String>,
    /// Whether the client may write this property.
    pub read_only: bool,
    /// Advertised numeric range, if any.
    pub range: Option<(f64, f64)>,
}

// =============================================================================
// Observable<T>
// =============================================================================

type Validator<T> = Arc<dyn Fn(&T) -> CameraResult<()> + Send + Sync>;

/// A thread-safe observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: PropertyMetadata,
    validator: Option<Validator<T>>,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            metadata: self.metadata.clone(),
            validator: self.validator.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: PropertyMetadata {
                name: name.into(),
                label: None,
                group: None,
                read_only: false,
                range: None,
            },
            validator: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = Some(label.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.metadata.group = Some(group.into());
        self
    }

    /// Mark this property as read-only for clients.
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> CameraResult<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &PropertyMetadata {
        &self.metadata
    }

    /// Validate a candidate value without storing it.
    pub fn validate(&self, value: &T) -> CameraResult<()> {
        if self.metadata.read_only {
            return Err(CameraError::InvalidArgument(format!(
                "property '{}' is read-only",
                self.metadata.name
            )));
        }
        match &self.validator {
            Some(validator) => validator(value),
            None => Ok(()),
        }
    }

    /// Set a client-requested value, notifying all subscribers.
    ///
    /// Fails without touching the stored value if the property is read-only
    /// or the validator rejects it.
    pub fn set(&self, value: T) -> CameraResult<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Reflect a value read back from the device. Bypasses validation: the
    /// hardware is the source of truth.
    pub fn publish(&self, value: T) {
        self.sender.send_replace(value);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Publish only if the value differs; returns whether it changed.
    pub fn publish_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + Into<f64> + 'static,
{
    /// Reject values outside `[min, max]`, and values that do not compare at
    /// all. Out-of-range writes fail loudly instead of being clamped.
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.metadata.range = Some((min.clone().into(), max.clone().into()));
        let name = self.metadata.name.clone();
        self.validator = Some(Arc::new(move |value: &T| {
            // Unordered values such as NaN fall outside every range
            if !(min.clone()..=max.clone()).contains(value) {
                Err(CameraError::InvalidArgument(format!(
                    "{name}: value {value:?} out of range [{min:?}, {max:?}]"
                )))
            } else {
                Ok(())
            }
        }));
        self
    }
}

impl<T> PropertyBase for Observable<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn get_json(&self) -> CameraResult<serde_json::Value> {
        serde_json::to_value(self.get()).map_err(|e| {
            CameraError::InvalidArgument(format!(
                "failed to serialize property '{}': {e}",
                self.metadata.name
            ))
        })
    }

    fn metadata(&self) -> &PropertyMetadata {
        &self.metadata
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// PropertySet - ordered collection
// =============================================================================

/// Ordered collection of properties. Iteration follows registration order,
/// which for generated controls is the order the device advertised them.
#[derive(Default)]
pub struct PropertySet {
    properties: Vec<Box<dyn PropertyBase>>,
}

impl Debug for PropertySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertySet")
            .field("names", &self.names())
            .finish()
    }
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property, replacing any existing one with the same name.
    pub fn register<P>(&mut self, property: P)
    where
        P: PropertyBase + 'static,
    {
        let boxed: Box<dyn PropertyBase> = Box::new(property);
        match self
            .properties
            .iter_mut()
            .find(|p| p.name() == boxed.name())
        {
            Some(slot) => *slot = boxed,
            None => self.properties.push(boxed),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn PropertyBase> {
        self.properties
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn get_typed<P: 'static>(&self, name: &str) -> Option<&P> {
        self.get(name).and_then(|p| p.as_any().downcast_ref::<P>())
    }

    pub fn names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn clear(&mut self) {
        self.properties.clear();
    }

    /// JSON snapshot of every property, in order.
    pub fn snapshot(&self) -> CameraResult<Vec<(String, serde_json::Value)>> {
        self.properties
            .iter()
            .map(|p| Ok((p.name().to_string(), p.get_json()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("Offset", 42_i64);
        assert_eq!(obs.get(), 42);
        assert_eq!(obs.name(), "Offset");

        obs.set(100).unwrap();
        assert_eq!(obs.get(), 100);
    }

    #[test]
    fn test_range_rejects_and_keeps_value() {
        let obs = Observable::new("Gain", 100.0_f64).with_range(0.0, 600.0);

        assert!(obs.set(250.0).is_ok());
        let err = obs.set(700.0).unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(_)));
        assert_eq!(obs.get(), 250.0);
        assert_eq!(obs.metadata().range, Some((0.0, 600.0)));
    }

    #[test]
    fn test_range_rejects_non_finite() {
        let exposure = Observable::new("Exposure", 1.0_f64).with_range(0.0, 10.0);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                exposure.set(bad),
                Err(CameraError::InvalidArgument(_))
            ));
        }
        assert_eq!(exposure.get(), 1.0);
    }

    #[test]
    fn test_read_only_rejects_set_but_accepts_publish() {
        let obs = Observable::new("SDK Version", "1.0".to_string()).read_only();

        assert!(obs.set("2.0".to_string()).is_err());
        obs.publish("1.1".to_string());
        assert_eq!(obs.get(), "1.1");
    }

    #[test]
    fn test_publish_if_changed() {
        let obs = Observable::new("Cooler", false);
        assert!(!obs.publish_if_changed(false));
        assert!(obs.publish_if_changed(true));
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("Temperature", 20.0_f64);
        let mut rx = obs.subscribe();

        obs.publish(-5.0);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), -5.0);
    }

    #[test]
    fn test_property_set_keeps_registration_order() {
        let mut set = PropertySet::new();
        set.register(Observable::new("Gain", 0_i64));
        set.register(Observable::new("Gamma", 0_i64));
        set.register(Observable::new("Offset", 0_i64));
        set.register(Observable::new("Gain", 5_i64));

        assert_eq!(set.names(), vec!["Gain", "Gamma", "Offset"]);
        let gain = set.get_typed::<Observable<i64>>("Gain").unwrap();
        assert_eq!(gain.get(), 5);
    }

    #[test]
    fn test_property_set_snapshot() {
        let mut set = PropertySet::new();
        set.register(Observable::new("Gain", 120_i64));
        set.register(Observable::new("Flip", true));

        let snapshot = set.snapshot().unwrap();
        assert_eq!(snapshot[0], ("Gain".to_string(), serde_json::json!(120)));
        assert_eq!(snapshot[1], ("Flip".to_string(), serde_json::json!(true)));
    }
}
