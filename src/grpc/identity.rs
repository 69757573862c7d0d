//! Identity and attribute extraction for incoming calls.
//!
//! An [`IdentityProvider`] turns a call into the [`RateKey`] used to build
//! counter keys. Providers see the call's [`CallContext`] and its request
//! payload through the [`Payload`] capability, which exposes the request as a
//! structured value without tying providers to a concrete message type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::Request;

use crate::error::IdentityError;
use crate::ratelimit::RateKey;

/// Default token used when no identity source is configured.
pub const ANONYMOUS: &str = "anonymous";

/// What an identity provider knows about the call besides its payload.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Fully-qualified method identifier, e.g. `/pkg.Echo/Say`
    pub method: &'a str,
    pub metadata: &'a MetadataMap,
    pub remote_addr: Option<SocketAddr>,
}

impl<'a> CallContext<'a> {
    pub fn new(method: &'a str, metadata: &'a MetadataMap) -> Self {
        Self {
            method,
            metadata,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Context for a tonic request routed to `method`.
    pub fn from_request<T>(method: &'a str, request: &'a Request<T>) -> Self {
        Self {
            method,
            metadata: request.metadata(),
            remote_addr: request.remote_addr(),
        }
    }
}

/// A request payload that can be inspected as a structured value.
///
/// Implemented for every serializable message, so providers can read fields
/// from any request type.
pub trait Payload: Sync {
    fn to_value(&self) -> Result<Value, serde_json::Error>;
}

impl<T: Serialize + Sync + ?Sized> Payload for T {
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Derives the identity token and attributes for one call.
pub trait IdentityProvider: Send + Sync {
    fn extract(
        &self,
        call: &CallContext<'_>,
        payload: &dyn Payload,
    ) -> Result<RateKey, IdentityError>;
}

impl<P: IdentityProvider + ?Sized> IdentityProvider for Arc<P> {
    fn extract(
        &self,
        call: &CallContext<'_>,
        payload: &dyn Payload,
    ) -> Result<RateKey, IdentityError> {
        (**self).extract(call, payload)
    }
}

/// Every call gets the same token.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    token: String,
}

impl StaticIdentity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Default for StaticIdentity {
    fn default() -> Self {
        Self::new(ANONYMOUS)
    }
}

impl IdentityProvider for StaticIdentity {
    fn extract(&self, _: &CallContext<'_>, _: &dyn Payload) -> Result<RateKey, IdentityError> {
        Ok(RateKey::new(self.token.clone()))
    }
}

/// Token read from a request metadata entry such as `x-user-id`.
#[derive(Debug, Clone)]
pub struct MetadataIdentity {
    key: String,
    fallback: Option<String>,
}

impl MetadataIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into().to_ascii_lowercase(),
            fallback: None,
        }
    }

    /// Token to use when the entry is absent. Without one, a missing entry
    /// fails the call.
    pub fn with_fallback(mut self, token: impl Into<String>) -> Self {
        self.fallback = Some(token.into());
        self
    }
}

impl IdentityProvider for MetadataIdentity {
    fn extract(&self, call: &CallContext<'_>, _: &dyn Payload) -> Result<RateKey, IdentityError> {
        match call.metadata.get(self.key.as_str()) {
            Some(value) => {
                let token = value
                    .to_str()
                    .map_err(|_| IdentityError::InvalidMetadata(self.key.clone()))?;
                Ok(RateKey::new(token))
            }
            None => self
                .fallback
                .clone()
                .map(RateKey::new)
                .ok_or_else(|| IdentityError::MissingMetadata(self.key.clone())),
        }
    }
}

/// Token taken from the peer's IP address.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIdentity;

impl IdentityProvider for PeerIdentity {
    fn extract(&self, call: &CallContext<'_>, _: &dyn Payload) -> Result<RateKey, IdentityError> {
        call.remote_addr
            .map(|addr| RateKey::new(addr.ip().to_string()))
            .ok_or(IdentityError::MissingPeer)
    }
}

/// Marks one payload field as a rate limiting attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTag {
    /// Attribute name in the storage key
    pub name: String,
    /// JSON pointer into the payload, e.g. `/account/region`
    pub path: String,
    /// Fail the call when the field is absent or null
    #[serde(default)]
    pub required: bool,
}

impl FieldTag {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Adds attributes pulled from tagged payload fields to another provider's
/// identity.
///
/// Strings, numbers and booleans are used as their plain text. Absent and
/// null fields are skipped unless the tag is required; objects and arrays
/// cannot be attributes.
#[derive(Debug, Clone)]
pub struct FieldTagAttributes<P> {
    inner: P,
    tags: Vec<FieldTag>,
}

impl<P: IdentityProvider> FieldTagAttributes<P> {
    pub fn new(inner: P, tags: Vec<FieldTag>) -> Self {
        Self { inner, tags }
    }
}

impl<P: IdentityProvider> IdentityProvider for FieldTagAttributes<P> {
    fn extract(
        &self,
        call: &CallContext<'_>,
        payload: &dyn Payload,
    ) -> Result<RateKey, IdentityError> {
        let mut key = self.inner.extract(call, payload)?;
        if self.tags.is_empty() {
            return Ok(key);
        }

        let value = payload.to_value()?;
        for tag in &self.tags {
            let rendered = match value.pointer(&tag.path) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                Some(Value::Bool(b)) => Some(b.to_string()),
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(IdentityError::UnsupportedField(tag.path.clone()))
                }
            };

            match rendered {
                Some(v) => {
                    key.attributes.insert(tag.name.clone(), v);
                }
                None if tag.required => return Err(IdentityError::MissingField(tag.path.clone())),
                None => {}
            }
        }

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Account {
        region: String,
        tier: u8,
    }

    #[derive(Serialize)]
    struct SayRequest {
        message: String,
        account: Account,
        trial: bool,
        tags: Vec<String>,
        note: Option<String>,
    }

    fn request() -> SayRequest {
        SayRequest {
            message: "hello".to_string(),
            account: Account {
                region: "eu".to_string(),
                tier: 2,
            },
            trial: true,
            tags: vec!["a".to_string()],
            note: None,
        }
    }

    #[test]
    fn test_static_identity() {
        let metadata = MetadataMap::new();
        let call = CallContext::new("/pkg.Echo/Say", &metadata);

        let key = StaticIdentity::default().extract(&call, &()).unwrap();
        assert_eq!(key, RateKey::new(ANONYMOUS));
    }

    #[test]
    fn test_metadata_identity() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-user-id", "u1".parse().unwrap());
        let call = CallContext::new("/pkg.Echo/Say", &metadata);

        let key = MetadataIdentity::new("X-User-Id").extract(&call, &()).unwrap();
        assert_eq!(key.identity, "u1");
    }

    #[test]
    fn test_metadata_identity_missing() {
        let metadata = MetadataMap::new();
        let call = CallContext::new("/pkg.Echo/Say", &metadata);

        let err = MetadataIdentity::new("x-user-id").extract(&call, &()).unwrap_err();
        assert!(matches!(err, IdentityError::MissingMetadata(k) if k == "x-user-id"));

        let key = MetadataIdentity::new("x-user-id")
            .with_fallback("guest")
            .extract(&call, &())
            .unwrap();
        assert_eq!(key.identity, "guest");
    }

    #[test]
    fn test_peer_identity() {
        let metadata = MetadataMap::new();
        let call = CallContext::new("/m", &metadata);
        assert!(matches!(
            PeerIdentity.extract(&call, &()),
            Err(IdentityError::MissingPeer)
        ));

        let call = call.with_remote_addr("10.0.0.7:5000".parse().unwrap());
        assert_eq!(PeerIdentity.extract(&call, &()).unwrap().identity, "10.0.0.7");
    }

    #[test]
    fn test_field_tags_extract_scalars() {
        let metadata = MetadataMap::new();
        let call = CallContext::new("/pkg.Echo/Say", &metadata);
        let provider = FieldTagAttributes::new(
            StaticIdentity::new("u1"),
            vec![
                FieldTag::new("region", "/account/region"),
                FieldTag::new("tier", "/account/tier"),
                FieldTag::new("trial", "/trial"),
                FieldTag::new("note", "/note"),
                FieldTag::new("missing", "/nope"),
            ],
        );

        let key = provider.extract(&call, &request()).unwrap();

        assert_eq!(key.identity, "u1");
        let attrs: Vec<(&str, &str)> = key
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(attrs, vec![("region", "eu"), ("tier", "2"), ("trial", "true")]);
    }

    #[test]
    fn test_field_tags_required_and_unsupported() {
        let metadata = MetadataMap::new();
        let call = CallContext::new("/pkg.Echo/Say", &metadata);

        let required = FieldTagAttributes::new(
            StaticIdentity::new("u1"),
            vec![FieldTag::new("note", "/note").required()],
        );
        assert!(matches!(
            required.extract(&call, &request()),
            Err(IdentityError::MissingField(p)) if p == "/note"
        ));

        let nested = FieldTagAttributes::new(
            StaticIdentity::new("u1"),
            vec![FieldTag::new("tags", "/tags")],
        );
        assert!(matches!(
            nested.extract(&call, &request()),
            Err(IdentityError::UnsupportedField(_))
        ));
    }
}
