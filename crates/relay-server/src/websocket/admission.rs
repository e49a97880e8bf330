//! Connection admission by query parameters.

use relay_core::{DeviceId, ProductId};
use serde::Deserialize;
use thiserror::Error;

use super::connection::Role;

/// Query parameters of a `/ws` upgrade request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// `?device-id=`
    #[serde(rename = "device-id")]
    pub device_id: Option<String>,
    /// `?product-id=`
    #[serde(rename = "product-id")]
    pub product_id: Option<String>,
}

/// Reasons a connection request is refused. The message is sent verbatim as
/// the close reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Neither parameter given.
    #[error("Missing device-id or product-id")]
    MissingIdentifier,
    /// Both parameters given.
    #[error("Can't provide both device-id and product-id")]
    ConflictingIdentifiers,
}

/// Decide the role for a connection request.
///
/// An empty value counts as absent.
pub fn admit(params: &ConnectParams) -> Result<Role, AdmissionError> {
    let device = params.device_id.as_deref().filter(|s| !s.is_empty());
    let product = params.product_id.as_deref().filter(|s| !s.is_empty());

    match (device, product) {
        (Some(id), None) => Ok(Role::Device(DeviceId::from(id))),
        (None, Some(id)) => Ok(Role::Product(ProductId::from(id))),
        (None, None) => Err(AdmissionError::MissingIdentifier),
        (Some(_), Some(_)) => Err(AdmissionError::ConflictingIdentifiers),
    }
}
