//! Client for the ESPHome native API, plaintext transport only.

use std::{
    collections::HashMap,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info};

use crate::{
    config::EspHomeConfig,
    notify::{error::NotifyError, worker::ActionClient},
};

pub mod codec;

use codec::{Frame, ServiceInfo};

const CLIENT_INFO: &str = "coverbridge";

pub struct EspHomeClient {
    host: String,
    port: u16,
    password: Option<String>,
    timeout: Duration,
    connection: Option<Connection>,
}

struct Connection {
    stream: TcpStream,
    services: HashMap<String, ServiceInfo>,
}

impl EspHomeClient {
    pub fn new(config: &EspHomeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            timeout: config.call_timeout(),
            connection: None,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn resolve(&self) -> Result<SocketAddr, NotifyError> {
        let addr = self.addr();
        let connection_error = |source| NotifyError::Connection {
            addr: addr.clone(),
            source,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(connection_error)?
            .next()
            .ok_or_else(|| {
                connection_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host did not resolve",
                ))
            })
    }

    fn open(&self) -> Result<Connection, NotifyError> {
        let socket = self.resolve()?;
        let stream = TcpStream::connect_timeout(&socket, self.timeout).map_err(|source| {
            NotifyError::Connection {
                addr: self.addr(),
                source,
            }
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        let mut connection = Connection {
            stream,
            services: HashMap::new(),
        };

        connection.send(codec::HELLO_REQUEST, &codec::hello_request(CLIENT_INFO))?;
        let hello = codec::HelloResponse::parse(&connection.wait_for(codec::HELLO_RESPONSE)?)?;
        debug!(
            "device '{}' speaks API {}.{} ({})",
            hello.name, hello.api_version_major, hello.api_version_minor, hello.server_info
        );

        connection.send(
            codec::CONNECT_REQUEST,
            &codec::connect_request(self.password.as_deref()),
        )?;
        if codec::connect_rejected(&connection.wait_for(codec::CONNECT_RESPONSE)?)? {
            return Err(NotifyError::InvalidPassword);
        }

        connection.list_services()?;
        info!(
            "connected to ESPHome device '{}' at {}, {} actions available",
            hello.name,
            self.addr(),
            connection.services.len()
        );
        Ok(connection)
    }

    fn connection(&mut self) -> Result<&mut Connection, NotifyError> {
        self.connection.as_mut().ok_or(NotifyError::NotConnected)
    }

    /// Forgets the connection when `result` says it is no longer usable.
    fn check<T>(&mut self, result: Result<T, NotifyError>) -> Result<T, NotifyError> {
        if let Err(err) = &result {
            if err.is_retryable() {
                self.connection = None;
            }
        }
        result
    }
}

impl ActionClient for EspHomeClient {
    fn connect(&mut self) -> Result<(), NotifyError> {
        self.disconnect();
        self.connection = Some(self.open()?);
        Ok(())
    }

    fn invoke(&mut self, action: &str, argument: Option<&str>) -> Result<(), NotifyError> {
        let connection = self.connection()?;
        let service = connection
            .services
            .get(action)
            .ok_or_else(|| NotifyError::ActionNotFound(action.to_string()))?;
        // Extra arguments make the device reject the call.
        let argument = argument.filter(|_| service.arg_count > 0);
        let request = codec::execute_service_request(service.key, argument);

        let result = connection
            .send(codec::EXECUTE_SERVICE_REQUEST, &request)
            .and_then(|()| connection.ping());
        self.check(result)
    }

    fn ping(&mut self) -> Result<(), NotifyError> {
        let result = self.connection().and_then(Connection::ping);
        self.check(result)
    }

    fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.send(codec::DISCONNECT_REQUEST, &[]) {
                debug!("disconnect request failed: {err}");
            }
            if let Err(err) = connection.stream.shutdown(Shutdown::Both) {
                debug!("socket shutdown failed: {err}");
            }
        }
    }
}

impl Connection {
    fn send(&mut self, msg_type: u32, payload: &[u8]) -> Result<(), NotifyError> {
        codec::write_frame(&mut self.stream, msg_type, payload)
    }

    /// Next frame that is not connection housekeeping.
    fn next_frame(&mut self) -> Result<Frame, NotifyError> {
        loop {
            let frame = codec::read_frame(&mut self.stream)?;
            match frame.msg_type {
                codec::PING_REQUEST => self.send(codec::PING_RESPONSE, &[])?,
                codec::DISCONNECT_REQUEST => {
                    if let Err(err) = self.send(codec::DISCONNECT_RESPONSE, &[]) {
                        debug!("disconnect response failed: {err}");
                    }
                    return Err(NotifyError::Protocol("device closed the connection".into()));
                }
                _ => return Ok(frame),
            }
        }
    }

    fn wait_for(&mut self, msg_type: u32) -> Result<Vec<u8>, NotifyError> {
        loop {
            let frame = self.next_frame()?;
            if frame.msg_type == msg_type {
                return Ok(frame.payload);
            }
            debug!(
                "ignoring message type {} while waiting for {msg_type}",
                frame.msg_type
            );
        }
    }

    fn list_services(&mut self) -> Result<(), NotifyError> {
        self.send(codec::LIST_ENTITIES_REQUEST, &[])?;
        loop {
            let frame = self.next_frame()?;
            match frame.msg_type {
                codec::LIST_ENTITIES_SERVICES_RESPONSE => {
                    let service = ServiceInfo::parse(&frame.payload)?;
                    self.services.insert(service.name.clone(), service);
                }
                codec::LIST_ENTITIES_DONE_RESPONSE => return Ok(()),
                _ => {}
            }
        }
    }

    fn ping(&mut self) -> Result<(), NotifyError> {
        self.send(codec::PING_REQUEST, &[])?;
        self.wait_for(codec::PING_RESPONSE).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        thread::{self, JoinHandle},
    };

    use super::codec::*;
    use super::*;

    fn config(port: u16, password: Option<&str>) -> anyhow::Result<EspHomeConfig> {
        let mut toml = format!("host = \"127.0.0.1\"\nport = {port}\ncall_timeout_ms = 2000\n");
        if let Some(password) = password {
            toml.push_str(&format!("password = \"{password}\"\n"));
        }
        Ok(toml::from_str(&toml)?)
    }

    fn service_entry(name: &str, key: u32, args: usize) -> Vec<u8> {
        let mut entry = Vec::new();
        write_bytes_field(&mut entry, 1, name.as_bytes());
        write_fixed32_field(&mut entry, 2, key);
        for _ in 0..args {
            let mut arg = Vec::new();
            write_bytes_field(&mut arg, 1, b"value");
            write_varint_field(&mut arg, 2, 3);
            write_bytes_field(&mut entry, 3, &arg);
        }
        entry
    }

    /// Accepts one client and answers the handshake, then hands over to `rest`.
    fn fake_device<F, T>(connect_response: Vec<u8>, rest: F) -> (u16, JoinHandle<T>)
    where
        F: FnOnce(&mut TcpStream) -> T + Send + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");

            let hello = read_frame(&mut stream).expect("hello");
            assert_eq!(hello.msg_type, HELLO_REQUEST);
            let mut reply = Vec::new();
            write_varint_field(&mut reply, 1, 1);
            write_varint_field(&mut reply, 2, 10);
            write_bytes_field(&mut reply, 4, b"display");
            write_frame(&mut stream, HELLO_RESPONSE, &reply).expect("hello response");

            let connect = read_frame(&mut stream).expect("connect");
            assert_eq!(connect.msg_type, CONNECT_REQUEST);
            write_frame(&mut stream, CONNECT_RESPONSE, &connect_response).expect("connect response");

            rest(&mut stream)
        });
        (port, handle)
    }

    fn answer_listing(stream: &mut TcpStream) {
        let list = read_frame(stream).expect("list entities");
        assert_eq!(list.msg_type, LIST_ENTITIES_REQUEST);
        // An unrelated entity type, skipped by the client.
        write_frame(stream, 12, &[0x0a, 0x01, b'x']).expect("entity");
        write_frame(
            stream,
            LIST_ENTITIES_SERVICES_RESPONSE,
            &service_entry("set_title", 0x11, 1),
        )
        .expect("service");
        write_frame(
            stream,
            LIST_ENTITIES_SERVICES_RESPONSE,
            &service_entry("refresh_cover", 0x22, 0),
        )
        .expect("service");
        write_frame(stream, LIST_ENTITIES_DONE_RESPONSE, &[]).expect("done");
    }

    #[test]
    fn executes_action_and_confirms_with_ping() -> anyhow::Result<()> {
        let (port, device) = fake_device(Vec::new(), |stream| {
            answer_listing(stream);

            let execute = read_frame(stream).expect("execute");
            // The device pings the client before answering.
            write_frame(stream, PING_REQUEST, &[]).expect("device ping");
            let mut seen = vec![read_frame(stream).expect("client ping").msg_type];
            write_frame(stream, PING_RESPONSE, &[]).expect("ping response");
            seen.push(read_frame(stream).expect("pong").msg_type);
            seen.push(read_frame(stream).expect("disconnect").msg_type);
            (execute, seen)
        });

        let mut client = EspHomeClient::new(&config(port, None)?);
        client.connect()?;
        client.invoke("set_title", Some("Song"))?;
        client.disconnect();

        let (execute, seen) = device.join().expect("device thread");
        assert_eq!(execute.msg_type, EXECUTE_SERVICE_REQUEST);
        assert_eq!(execute.payload, execute_service_request(0x11, Some("Song")));
        assert_eq!(seen, vec![PING_REQUEST, PING_RESPONSE, DISCONNECT_REQUEST]);
        Ok(())
    }

    #[test]
    fn argument_is_left_out_for_actions_without_parameters() -> anyhow::Result<()> {
        let (port, device) = fake_device(Vec::new(), |stream| {
            answer_listing(stream);
            let execute = read_frame(stream).expect("execute");
            let _ = read_frame(stream).expect("ping");
            write_frame(stream, PING_RESPONSE, &[]).expect("ping response");
            execute
        });

        let mut client = EspHomeClient::new(&config(port, None)?);
        client.connect()?;
        client.invoke("refresh_cover", Some("ignored"))?;

        let execute = device.join().expect("device thread");
        assert_eq!(execute.payload, execute_service_request(0x22, None));
        Ok(())
    }

    #[test]
    fn unknown_action_keeps_the_connection() -> anyhow::Result<()> {
        let (port, device) = fake_device(Vec::new(), |stream| {
            answer_listing(stream);
            let ping = read_frame(stream).expect("ping");
            write_frame(stream, PING_RESPONSE, &[]).expect("ping response");
            ping.msg_type
        });

        let mut client = EspHomeClient::new(&config(port, None)?);
        client.connect()?;

        assert!(matches!(
            client.invoke("missing", None),
            Err(NotifyError::ActionNotFound(name)) if name == "missing"
        ));
        client.ping()?;
        assert_eq!(device.join().expect("device thread"), PING_REQUEST);
        Ok(())
    }

    #[test]
    fn rejected_password_is_reported() -> anyhow::Result<()> {
        let (port, device) = fake_device(vec![0x08, 0x01], |_| ());

        let mut client = EspHomeClient::new(&config(port, Some("wrong"))?);

        assert!(matches!(
            client.connect(),
            Err(NotifyError::InvalidPassword)
        ));
        assert!(matches!(
            client.invoke("set_title", None),
            Err(NotifyError::NotConnected)
        ));
        device.join().expect("device thread");
        Ok(())
    }

    #[test]
    fn unreachable_device_is_a_connection_error() -> anyhow::Result<()> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };

        let mut client = EspHomeClient::new(&config(port, None)?);

        assert!(matches!(
            client.connect(),
            Err(NotifyError::Connection { .. })
        ));
        Ok(())
    }
}
