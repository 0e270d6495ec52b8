use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::{sleep, Sleep};
use tower::Service;

const READ_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Serve an axum router on an already-bound loopback listener from the
/// calling thread, on a current-thread runtime, until `shutdown_rx` fires.
///
/// Connection deadlines: request heads must arrive within 15 s, each socket
/// write must progress within 15 s, and a connection quiet on the read side
/// for 60 s (idle keep-alive included) is dropped.
pub fn serve_blocking(
    listener: std::net::TcpListener,
    router: Router,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    rt.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
        let make_service = router.into_make_service();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept error on loopback server: {e}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(TimedStream::new(stream, IDLE_TIMEOUT, WRITE_TIMEOUT));
                    let mut make_svc = make_service.clone();

                    tokio::task::spawn(async move {
                        let service = make_svc.call(()).await.expect("create service");
                        let hyper_service = TowerToHyperService::new(service);
                        if let Err(err) = http1::Builder::new()
                            .timer(TokioTimer::new())
                            .header_read_timeout(READ_TIMEOUT)
                            .serve_connection(io, hyper_service)
                            .await
                        {
                            debug!("Error serving connection: {err:?}");
                        }
                    });
                }
            }
        }
    });
}

/// I/O wrapper enforcing per-direction deadlines: an operation that stays
/// pending past its timeout fails the connection with `TimedOut`. The clock
/// arms when an operation first returns pending and clears on progress, so
/// the read deadline doubles as the idle limit between keep-alive requests.
struct TimedStream<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, timeout: Duration, cx: &mut Context<'_>) -> Poll<()> {
    let sleep = deadline.get_or_insert_with(|| Box::pin(sleep(timeout)));
    sleep.as_mut().poll(cx)
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.read_deadline, this.read_timeout, cx) {
                Poll::Ready(()) => {
                    this.read_deadline = None;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection read timed out",
                    )))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.write_deadline, this.write_timeout, cx) {
                Poll::Ready(()) => {
                    this.write_deadline = None;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection write timed out",
                    )))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
