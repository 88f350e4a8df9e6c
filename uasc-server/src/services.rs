// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The service dispatch table. Built once at server construction; maps the request type of
//! an inbound message to its handler and tells the connection actor whether the service
//! needs an activated session. There is no process-global registration.

use std::sync::Arc;

use hashbrown::HashMap;

use uasc_core::{
    comms::secure_channel::SecureChannel, sync::RwLock, Message, RequestMessage, ResponseMessage,
};
use uasc_types::{Error, ObjectId, StatusCode};

use crate::session_manager::Session;

/// What a handler gets to work with.
pub struct ServiceContext<'a> {
    /// The channel the request arrived on.
    pub channel: &'a Arc<RwLock<SecureChannel>>,
    /// The session the request is bound to, when the service requires one.
    pub session: Option<Arc<RwLock<Session>>>,
}

/// A service implementation. Handlers run on the network loop and must not block; anything
/// long-running is handed to a worker and completed through the async call manager.
pub type ServiceHandler = Box<
    dyn Fn(&mut ServiceContext<'_>, RequestMessage) -> Result<ResponseMessage, StatusCode>
        + Send
        + Sync,
>;

struct ServiceTableEntry {
    handler: ServiceHandler,
    requires_session: bool,
}

/// The dispatch table, keyed by the numeric binary encoding id of the request type.
#[derive(Default)]
pub struct ServiceTable {
    services: HashMap<u32, ServiceTableEntry>,
}

impl ServiceTable {
    /// An empty table.
    pub fn new() -> ServiceTable {
        ServiceTable::default()
    }

    /// Register a handler for a request type. Registering the same request type twice is
    /// an error; the original entry stays in place.
    pub fn register(
        &mut self,
        request_type: ObjectId,
        requires_session: bool,
        handler: ServiceHandler,
    ) -> Result<(), Error> {
        let key = request_type as u32;
        if self.services.contains_key(&key) {
            return Err(Error::new(
                StatusCode::BadInternalError,
                format!("Service for request type {request_type:?} is already registered"),
            ));
        }
        self.services.insert(
            key,
            ServiceTableEntry {
                handler,
                requires_session,
            },
        );
        Ok(())
    }

    /// Whether the request type's service requires an activated session. `None` when the
    /// type is not registered at all.
    pub fn requires_session(&self, request: &RequestMessage) -> Option<bool> {
        let object_id = request.type_id().as_object_id().ok()?;
        self.services
            .get(&(object_id as u32))
            .map(|entry| entry.requires_session)
    }

    /// Dispatch a request to its handler.
    pub fn dispatch(
        &self,
        context: &mut ServiceContext<'_>,
        request: RequestMessage,
    ) -> Result<ResponseMessage, StatusCode> {
        let object_id = request
            .type_id()
            .as_object_id()
            .map_err(|_| StatusCode::BadServiceUnsupported)?;
        let Some(entry) = self.services.get(&(object_id as u32)) else {
            return Err(StatusCode::BadServiceUnsupported);
        };
        (entry.handler)(context, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_core::comms::secure_channel::Role;
    use uasc_crypto::CertificateStore;
    use uasc_types::{
        DecodingOptions, FindServersRequest, FindServersResponse, RequestHeader, ResponseHeader,
        UAString,
    };

    fn noop_handler() -> ServiceHandler {
        Box::new(|_, request| {
            Ok(FindServersResponse {
                response_header: ResponseHeader::new_good(request.request_header()),
                servers: None,
            }
            .into())
        })
    }

    fn find_servers_request() -> RequestMessage {
        FindServersRequest {
            request_header: RequestHeader::default(),
            endpoint_url: UAString::null(),
            locale_ids: None,
            server_uris: None,
        }
        .into()
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut table = ServiceTable::new();
        table
            .register(
                ObjectId::FindServersRequest_Encoding_DefaultBinary,
                false,
                noop_handler(),
            )
            .unwrap();
        let err = table
            .register(
                ObjectId::FindServersRequest_Encoding_DefaultBinary,
                false,
                noop_handler(),
            )
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadInternalError);

        // The original registration is intact.
        assert_eq!(
            table.requires_session(&find_servers_request()),
            Some(false)
        );
    }

    #[test]
    fn unknown_service_is_unsupported() {
        let table = ServiceTable::new();
        let channel = Arc::new(RwLock::new(SecureChannel::new(
            &CertificateStore::default(),
            Role::Server,
            DecodingOptions::default(),
        )));
        let mut context = ServiceContext {
            channel: &channel,
            session: None,
        };
        let err = table
            .dispatch(&mut context, find_servers_request())
            .unwrap_err();
        assert_eq!(err, StatusCode::BadServiceUnsupported);
    }

    #[test]
    fn dispatch_runs_handler() {
        let mut table = ServiceTable::new();
        table
            .register(
                ObjectId::FindServersRequest_Encoding_DefaultBinary,
                false,
                noop_handler(),
            )
            .unwrap();
        let channel = Arc::new(RwLock::new(SecureChannel::new(
            &CertificateStore::default(),
            Role::Server,
            DecodingOptions::default(),
        )));
        let mut context = ServiceContext {
            channel: &channel,
            session: None,
        };
        let response = table
            .dispatch(&mut context, find_servers_request())
            .unwrap();
        assert!(matches!(response, ResponseMessage::FindServers(_)));
    }
}
