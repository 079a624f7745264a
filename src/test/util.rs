use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use bson::{doc, Document, RawDocumentBuf};

use crate::{
    cmap::{ConnectSettings, Connector, WireChannel},
    error::{Error, Result},
    hello::LEGACY_HELLO_COMMAND_NAME,
    options::{ClientOptions, ServerAddress},
    BoxFuture,
};

/// A scripted in-memory deployment. Each server has a fixed hello response and a FIFO script
/// of responses for application commands; every non-hello request is recorded for assertions.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockCluster {
    inner: Arc<Mutex<HashMap<ServerAddress, ServerScript>>>,
}

#[derive(Debug, Default)]
struct ServerScript {
    hello: Document,
    responses: VecDeque<ScriptedResponse>,
    requests: Vec<Document>,
}

#[derive(Debug)]
pub(crate) enum ScriptedResponse {
    Reply(Document),
    NetworkError,
}

impl MockCluster {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn add_server(&self, address: &str, hello: Document) {
        let address = ServerAddress::parse(address).unwrap();
        self.inner.lock().unwrap().insert(
            address,
            ServerScript {
                hello,
                ..Default::default()
            },
        );
    }

    pub(crate) fn enqueue(&self, address: &str, response: ScriptedResponse) {
        let address = ServerAddress::parse(address).unwrap();
        self.inner
            .lock()
            .unwrap()
            .get_mut(&address)
            .expect("server not scripted")
            .responses
            .push_back(response);
    }

    /// The application commands this server has received, in order.
    pub(crate) fn requests(&self, address: &str) -> Vec<Document> {
        let address = ServerAddress::parse(address).unwrap();
        self.inner
            .lock()
            .unwrap()
            .get(&address)
            .map(|script| script.requests.clone())
            .unwrap_or_default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    /// Client options wired to this cluster, with monitor tasks disabled so tests drive the
    /// topology deterministically through the updater.
    pub(crate) fn client_options(&self, hosts: &[&str]) -> ClientOptions {
        let mut options = ClientOptions::builder()
            .hosts(
                hosts
                    .iter()
                    .map(|h| ServerAddress::parse(h).unwrap())
                    .collect::<Vec<_>>(),
            )
            .connector(self.connector())
            .build();
        options.test_options_mut().disable_monitoring_threads = true;
        options
    }
}

#[derive(Debug)]
struct MockConnector {
    cluster: MockCluster,
}

impl Connector for MockConnector {
    fn connect(
        &self,
        address: ServerAddress,
        _settings: ConnectSettings,
    ) -> BoxFuture<'static, Result<Box<dyn WireChannel>>> {
        let cluster = self.cluster.clone();
        Box::pin(async move {
            if !cluster.inner.lock().unwrap().contains_key(&address) {
                return Err(Error::from_io(std::io::ErrorKind::ConnectionRefused.into()));
            }
            Ok(Box::new(MockChannel { address, cluster }) as Box<dyn WireChannel>)
        })
    }
}

#[derive(Debug)]
struct MockChannel {
    address: ServerAddress,
    cluster: MockCluster,
}

impl WireChannel for MockChannel {
    fn round_trip(&mut self, request: RawDocumentBuf) -> BoxFuture<'_, Result<RawDocumentBuf>> {
        Box::pin(async move {
            let request: Document = bson::from_slice(request.as_bytes())?;

            let reply = {
                let mut guard = self.cluster.inner.lock().unwrap();
                let script = guard.get_mut(&self.address).ok_or_else(|| {
                    Error::from_io(std::io::ErrorKind::ConnectionReset.into())
                })?;

                let is_hello = request.contains_key("hello")
                    || request.contains_key(LEGACY_HELLO_COMMAND_NAME);
                if is_hello {
                    script.hello.clone()
                } else {
                    script.requests.push(request);
                    match script.responses.pop_front() {
                        Some(ScriptedResponse::Reply(doc)) => doc,
                        Some(ScriptedResponse::NetworkError) => {
                            return Err(Error::from_io(
                                std::io::ErrorKind::ConnectionReset.into(),
                            ))
                        }
                        None => doc! { "ok": 1 },
                    }
                }
            };

            let bytes = bson::to_vec(&reply)?;
            RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
        })
    }

    fn shutdown(&mut self) {}
}

/// A hello response for a mongos.
pub(crate) fn mongos_hello() -> Document {
    doc! {
        "ok": 1,
        "msg": "isdbgrid",
        "minWireVersion": 7,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30_i64,
    }
}

/// A hello response for a standalone mongod.
pub(crate) fn standalone_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "minWireVersion": 7,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30_i64,
    }
}
