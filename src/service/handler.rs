use domain::net::server::message::Request;
use domain::net::server::service::{CallResult, ServiceError};
use futures::channel::mpsc::UnboundedSender;

pub type HandlerResult<T> = Result<T, ServiceError>;

pub trait HandleDns {
    /// Handles one request end to end. `None` means the request is dropped
    /// without a reply (the rate limiter's silent path).
    fn handle_non_axfr(
        &self,
        request: Request<Vec<u8>>,
    ) -> impl std::future::Future<Output = HandlerResult<Option<CallResult<Vec<u8>>>>> + Send;

    /// Streams a zone transfer into `sender`.
    fn handle_axfr(
        &self,
        request: Request<Vec<u8>>,
        sender: UnboundedSender<HandlerResult<CallResult<Vec<u8>>>>,
    ) -> HandlerResult<()>;
}
