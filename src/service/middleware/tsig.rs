//! TSIG middleware: validates the MAC on signed requests against the
//! transfer key and signs every reply in the transaction. An invalid
//! signature turns the reply into NOTAUTH.

use core::future::{ready, Ready};

use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::message_builder::AdditionalBuilder;
use domain::base::wire::Composer;
use domain::base::{Message, StreamTarget, ToName};
use domain::dep::octseq::Octets;
use domain::net::server::message::Request;
use domain::net::server::middleware::stream::{MiddlewareStream, PostprocessingStream};
use domain::net::server::service::{Service, ServiceResult};
use domain::net::server::util::mk_builder_for_target;
use domain::rdata::tsig::Time48;
use domain::tsig::{Algorithm, Key, KeyName, KeyStore, ServerTransaction};
use futures::stream::Once;

pub const AXFR_KEY_NAME: &str = "axfr";

/// The server's single transfer key, shaped as a key store for the tsig
/// machinery.
#[derive(Clone)]
pub struct AxfrKeyStore {
    key: Arc<Key>,
}

impl AxfrKeyStore {
    /// Builds the store from the configured transfer secret. The stack signs
    /// with HMAC-SHA256; the legacy HMAC-MD5 is not available in it.
    pub fn from_secret(secret: &str) -> crate::error::Result<AxfrKeyStore> {
        let name = KeyName::from_str(AXFR_KEY_NAME)?;
        let key = Key::new(Algorithm::Sha256, secret.as_bytes(), name, None, None)?;
        Ok(AxfrKeyStore { key: Arc::new(key) })
    }
}

impl KeyStore for AxfrKeyStore {
    type Key = Arc<Key>;

    fn get_key<N: ToName>(&self, name: &N, algorithm: Algorithm) -> Option<Self::Key> {
        if self.key.algorithm() == algorithm
            && self.key.name().to_name::<Bytes>() == name.to_name::<Bytes>()
        {
            Some(self.key.clone())
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct TsigMiddlewareSvc<RequestOctets, Svc> {
    keystore: AxfrKeyStore,
    svc: Svc,
    _octets: PhantomData<RequestOctets>,
}

impl<RequestOctets, Svc> TsigMiddlewareSvc<RequestOctets, Svc>
where
    RequestOctets: Octets + Send + Sync + Unpin + Clone,
    Svc: Service<RequestOctets>,
    Svc::Target: Composer + Default,
{
    pub fn new(keystore: AxfrKeyStore, svc: Svc) -> Self {
        Self {
            keystore,
            svc,
            _octets: PhantomData,
        }
    }

    /// Runs the TSIG transaction for one stream item: requests without a
    /// signature pass through, valid signatures get the reply signed, and
    /// anything else is answered with NOTAUTH.
    fn postprocess(
        keystore: &AxfrKeyStore,
        request: &Request<RequestOctets>,
        response: &mut AdditionalBuilder<StreamTarget<Svc::Target>>,
    ) -> Result<(), AdditionalBuilder<StreamTarget<Svc::Target>>> {
        let bytes = request.message().as_slice().to_vec();
        let Ok(mut message) = Message::from_octets(bytes) else {
            return Ok(());
        };

        match ServerTransaction::request::<AxfrKeyStore, Vec<u8>>(
            keystore,
            &mut message,
            Time48::now(),
        ) {
            Ok(None) => Ok(()),
            Ok(Some(transaction)) => {
                if let Err(e) = transaction.answer(response, Time48::now()) {
                    log::error!(target: "tsig", "failed to sign reply: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                log::error!(target: "tsig", "tsig validation failed: {}", e);
                let builder = mk_builder_for_target();
                match builder.start_answer(&message, Rcode::NOTAUTH) {
                    Ok(answer) => Err(answer.additional()),
                    Err(_) => Ok(()),
                }
            }
        }
    }

    fn map_stream_item(
        request: Request<RequestOctets>,
        mut stream_item: ServiceResult<Svc::Target>,
        keystore: &mut AxfrKeyStore,
    ) -> ServiceResult<Svc::Target> {
        if let Ok(cr) = &mut stream_item {
            if let Some(response) = cr.response_mut() {
                if let Err(notauth) = Self::postprocess(keystore, &request, response) {
                    *response = notauth;
                }
            }
        }
        stream_item
    }
}

impl<RequestOctets, Svc> Service<RequestOctets> for TsigMiddlewareSvc<RequestOctets, Svc>
where
    RequestOctets: Octets + Send + Sync + 'static + Unpin + Clone,
    Svc: Service<RequestOctets>,
    Svc::Future: core::future::Future + Unpin,
    <Svc::Future as core::future::Future>::Output: Unpin,
    Svc::Target: Composer + Default,
{
    type Target = Svc::Target;
    type Stream = MiddlewareStream<
        Svc::Future,
        Svc::Stream,
        PostprocessingStream<RequestOctets, Svc::Future, Svc::Stream, (), AxfrKeyStore>,
        Once<Ready<<Svc::Stream as futures::stream::Stream>::Item>>,
        <Svc::Stream as futures::stream::Stream>::Item,
    >;
    type Future = core::future::Ready<Self::Stream>;

    fn call(&self, request: Request<RequestOctets>) -> Self::Future {
        let svc_call_fut = self.svc.call(request.clone());
        let map = PostprocessingStream::new(
            svc_call_fut,
            request,
            self.keystore.clone(),
            Self::map_stream_item,
        );
        ready(MiddlewareStream::Map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_store_matches_name_and_algorithm() {
        let store = AxfrKeyStore::from_secret("random").unwrap();
        let name = KeyName::from_str("axfr").unwrap();
        assert!(store.get_key(&name, Algorithm::Sha256).is_some());
        assert!(store.get_key(&name, Algorithm::Sha512).is_none());

        let other = KeyName::from_str("other").unwrap();
        assert!(store.get_key(&other, Algorithm::Sha256).is_none());
    }
}
