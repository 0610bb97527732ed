use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use prost_reflect::{DynamicMessage, Kind, MethodDescriptor, ReflectMessage, ServiceDescriptor};

use crate::error::RouterError;

/// Extracts the routing key from a method's decoded request.
pub type KeyFn = Arc<dyn Fn(&DynamicMessage) -> Result<String, RouterError> + Send + Sync>;

/// An RPC service known to the router.
///
/// A service is either key-routable, with a key extractor for every one of its methods, or
/// unrouted. Which one is fixed when the service is built.
#[derive(Clone)]
pub struct Service {
    descriptor: ServiceDescriptor,
    key_fns: Option<HashMap<String, KeyFn, ahash::RandomState>>,
}

impl Service {
    /// Build a service routed on the string field `key_field` of every request type.
    ///
    /// Fails if any method's request type lacks a non-repeated `string` field with that name;
    /// such services have to be registered with [`Service::new_unrouted`] instead.
    pub fn new_routed(
        descriptor: ServiceDescriptor,
        key_field: &str,
    ) -> Result<Service, RouterError> {
        let key_fns = descriptor
            .methods()
            .map(|method| Ok((method.name().to_string(), field_key_fn(&method, key_field)?)))
            .collect::<Result<_, RouterError>>()?;

        Ok(Self {
            descriptor,
            key_fns: Some(key_fns),
        })
    }

    /// Build a service whose calls are routed on the service name alone.
    pub fn new_unrouted(descriptor: ServiceDescriptor) -> Service {
        Self {
            descriptor,
            key_fns: None,
        }
    }

    /// The fully-qualified service name.
    pub fn name(&self) -> &str {
        self.descriptor.full_name()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn is_routed(&self) -> bool {
        self.key_fns.is_some()
    }

    pub fn method(&self, name: &str) -> Option<MethodDescriptor> {
        self.descriptor.methods().find(|method| method.name() == name)
    }

    /// The key extractor for `method`, `None` for unrouted services.
    pub fn key_fn(&self, method: &str) -> Option<&KeyFn> {
        self.key_fns.as_ref().and_then(|key_fns| key_fns.get(method))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("routed", &self.is_routed())
            .finish()
    }
}

fn field_key_fn(method: &MethodDescriptor, key_field: &str) -> Result<KeyFn, RouterError> {
    let input = method.input();
    let usable = input.get_field_by_name(key_field).is_some_and(|field| {
        !field.is_list() && !field.is_map() && matches!(field.kind(), Kind::String)
    });
    if !usable {
        return Err(RouterError::KeyField {
            method: method.full_name().to_string(),
            message: input.full_name().to_string(),
            field: key_field.to_string(),
        });
    }

    let key_field = key_field.to_string();
    Ok(Arc::new(move |message: &DynamicMessage| {
        message
            .get_field_by_name(&key_field)
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| RouterError::KeyExtraction {
                message: message.descriptor().full_name().to_string(),
                field: key_field.clone(),
            })
    }))
}
