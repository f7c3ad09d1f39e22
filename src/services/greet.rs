use std::time::Duration;

use bincode::{Decode, Encode};
use log::{debug, info};

use crate::{
    Client, Deadline, Status,
    client::{ClientStreamingCall, RequestSink, ResponseStream},
    server::{CallContext, RequestStream, ResponseSink, Service},
    transport::IncomingCall,
};

pub const SERVICE: &str = "greet.GreetService";

#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct Greeting {
    pub first_name: String,
    pub last_name: String,
}

impl Greeting {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct GreetRequest {
    pub greeting: Greeting,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct GreetResponse {
    pub result: String,
}

/// Pacing of the slow methods.
#[derive(Clone, Copy, Debug)]
pub struct GreetService {
    step: Duration,
    interval: Duration,
}

impl Default for GreetService {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            interval: Duration::from_secs(1),
        }
    }
}

impl GreetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of each of the three steps `GreetWithDeadline` takes.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Pause between `GreetManyTimes` responses.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn greet(&self, _: &CallContext, request: GreetRequest) -> Result<GreetResponse, Status> {
        debug!("Greet invoked with {request:?}");
        Ok(reply(format!("Hello {}", request.greeting.first_name)))
    }

    fn greet_with_deadline(
        &self,
        context: &CallContext,
        request: GreetRequest,
    ) -> Result<GreetResponse, Status> {
        debug!("GreetWithDeadline invoked with {request:?}");
        for _ in 0..3 {
            if context.is_cancelled() || context.sleep(self.step).is_err() {
                info!("client cancelled the request");
                return Err(Status::deadline_exceeded("The client canceled the request"));
            }
        }
        Ok(reply(format!("Hello {}", request.greeting.first_name)))
    }

    fn greet_many_times(
        &self,
        context: &CallContext,
        request: GreetRequest,
        responses: &ResponseSink<GreetResponse>,
    ) -> Result<(), Status> {
        debug!("GreetManyTimes invoked with {request:?}");
        let first_name = &request.greeting.first_name;
        for i in 0..10 {
            if i > 0 {
                context.sleep(self.interval)?;
            }
            responses.send(reply(format!("Hello {first_name} number {i}")))?;
        }
        Ok(())
    }

    fn long_greet(
        &self,
        _: &CallContext,
        requests: &mut RequestStream<GreetRequest>,
    ) -> Result<GreetResponse, Status> {
        let mut result = "Hello ".to_string();
        for request in requests {
            result.push_str(&format!("Hello {}! ", request?.greeting.first_name));
        }
        Ok(reply(result))
    }

    fn greet_everyone(
        &self,
        _: &CallContext,
        requests: &mut RequestStream<GreetRequest>,
        responses: &ResponseSink<GreetResponse>,
    ) -> Result<(), Status> {
        for request in requests {
            responses.send(reply(format!("Hello {}! ", request?.greeting.first_name)))?;
        }
        Ok(())
    }
}

fn reply(result: String) -> GreetResponse {
    GreetResponse { result }
}

impl Service for GreetService {
    fn name(&self) -> &str {
        SERVICE
    }

    fn dispatch(&self, method: &str, call: IncomingCall) {
        match method {
            "Greet" => call.unary(|context, request| self.greet(context, request)),
            "GreetWithDeadline" => {
                call.unary(|context, request| self.greet_with_deadline(context, request))
            }
            "GreetManyTimes" => call.server_streaming(|context, request, responses| {
                self.greet_many_times(context, request, responses)
            }),
            "LongGreet" => {
                call.client_streaming(|context, requests| self.long_greet(context, requests))
            }
            "GreetEveryone" => call.bidi_streaming(|context, requests, responses| {
                self.greet_everyone(context, requests, responses)
            }),
            _ => call.reject(Status::unimplemented(format!(
                "unknown method {SERVICE}/{method}"
            ))),
        }
    }
}

/// Typed calls to a remote [`GreetService`].
#[derive(Clone)]
pub struct GreetClient {
    client: Client,
}

impl GreetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn greet(&self, greeting: Greeting, deadline: Deadline) -> Result<GreetResponse, Status> {
        self.client
            .call_unary(&method("Greet"), GreetRequest { greeting }, deadline)
    }

    pub fn greet_with_deadline(
        &self,
        greeting: Greeting,
        deadline: Deadline,
    ) -> Result<GreetResponse, Status> {
        self.client.call_unary(
            &method("GreetWithDeadline"),
            GreetRequest { greeting },
            deadline,
        )
    }

    pub fn greet_many_times(
        &self,
        greeting: Greeting,
        deadline: Deadline,
    ) -> Result<ResponseStream<GreetResponse>, Status> {
        self.client.call_server_streaming(
            &method("GreetManyTimes"),
            GreetRequest { greeting },
            deadline,
        )
    }

    pub fn long_greet(
        &self,
        deadline: Deadline,
    ) -> Result<ClientStreamingCall<GreetRequest, GreetResponse>, Status> {
        self.client
            .call_client_streaming(&method("LongGreet"), deadline)
    }

    pub fn greet_everyone(
        &self,
        deadline: Deadline,
    ) -> Result<(RequestSink<GreetRequest>, ResponseStream<GreetResponse>), Status> {
        self.client
            .call_bidi_streaming(&method("GreetEveryone"), deadline)
    }
}

fn method(name: &str) -> String {
    format!("{SERVICE}/{name}")
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        Code,
        deadline::with_timeout,
        server::{Router, Server},
        transport::Connection,
    };

    fn client(service: GreetService) -> GreetClient {
        let server = Server::new(Router::new().add_service(service), 4).unwrap();
        let (connection, _server_end, acceptor) = Connection::pair().unwrap();
        server.spawn(acceptor).unwrap();
        GreetClient::new(Client::new(connection))
    }

    fn fast() -> GreetService {
        GreetService::new()
            .with_step(Duration::from_millis(5))
            .with_interval(Duration::ZERO)
    }

    fn request(first_name: &str, last_name: &str) -> GreetRequest {
        GreetRequest {
            greeting: Greeting::new(first_name, last_name),
        }
    }

    #[test]
    fn greet_says_hello() {
        let greet = client(fast());
        let response = greet
            .greet(Greeting::new("Stephan", "Maersk"), Deadline::none())
            .unwrap();
        assert_eq!(response.result, "Hello Stephan");
    }

    #[test]
    fn greet_many_times_streams_ten_greetings() {
        let greet = client(fast());
        let stream = greet
            .greet_many_times(Greeting::new("Stephan", "Maersk"), Deadline::none())
            .unwrap();

        let results: Vec<String> = stream.map(|r| r.unwrap().result).collect();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0], "Hello Stephan number 0");
        assert_eq!(results[9], "Hello Stephan number 9");
    }

    #[test]
    fn long_greet_answers_after_half_close() {
        let greet = client(fast());
        let call = greet.long_greet(Deadline::none()).unwrap();
        for name in ["Stephan", "Test"] {
            call.send(request(name, "")).unwrap();
        }

        let response = call.finish().unwrap();
        assert_eq!(response.result, "Hello Hello Stephan! Hello Test! ");
    }

    #[test]
    fn greet_everyone_interleaves_send_and_receive() {
        let greet = client(fast());
        let (sink, stream) = greet.greet_everyone(Deadline::none()).unwrap();

        let sender = thread::spawn(move || {
            for (first, last) in [("Stephan", "Maersk"), ("Test", "123")] {
                sink.send(request(first, last)).unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            sink.close_send().unwrap();
        });
        let receiver = thread::spawn(move || {
            let results: Vec<String> = stream.map(|r| r.unwrap().result).collect();
            results
        });

        sender.join().unwrap();
        assert_eq!(
            receiver.join().unwrap(),
            vec!["Hello Stephan! ".to_string(), "Hello Test! ".to_string()]
        );
    }

    #[test]
    fn greet_everyone_ends_ok() {
        let greet = client(fast());
        let (sink, mut stream) = greet.greet_everyone(Deadline::none()).unwrap();
        sink.send(request("Stephan", "Maersk")).unwrap();
        assert_eq!(stream.recv().unwrap().unwrap().result, "Hello Stephan! ");

        drop(sink);
        assert!(stream.recv().unwrap().is_none());
        assert_eq!(stream.status(), Some(Status::ok()));
    }

    #[test]
    fn greet_with_deadline_finishes_in_time() {
        let greet = client(fast());
        let (deadline, _) = with_timeout(Some(Duration::from_secs(5)));
        let response = greet
            .greet_with_deadline(Greeting::new("Stephan", ""), deadline)
            .unwrap();
        assert_eq!(response.result, "Hello Stephan");
    }

    #[test]
    fn greet_with_deadline_times_out() {
        let greet = client(GreetService::new().with_step(Duration::from_millis(200)));
        let (deadline, _) = with_timeout(Some(Duration::from_millis(50)));
        let err = greet
            .greet_with_deadline(Greeting::new("Stephan", ""), deadline)
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn unknown_greet_method_is_unimplemented() {
        let greet = client(fast());
        let err = greet
            .client
            .call_unary::<GreetRequest, GreetResponse>(
                &method("Farewell"),
                request("Stephan", ""),
                Deadline::none(),
            )
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
