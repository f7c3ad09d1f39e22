use bincode::{Decode, Encode};
use log::{debug, trace};

use crate::{
    Client, Deadline, Status,
    client::{ClientStreamingCall, RequestSink, ResponseStream},
    server::{CallContext, RequestStream, ResponseSink, Service},
    transport::IncomingCall,
};

pub const SERVICE: &str = "calculator.CalculatorService";

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct SumRequest {
    pub first_number: i32,
    pub second_number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct SumResponse {
    pub sum_result: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct PrimeNumberDecompositionRequest {
    pub number: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct PrimeNumberDecompositionResponse {
    pub prime_factor: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct ComputeAverageRequest {
    pub number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct ComputeAverageResponse {
    pub average: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct FindMaximumRequest {
    pub number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct FindMaximumResponse {
    pub maximum: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct SquareRootRequest {
    pub number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct SquareRootResponse {
    pub number_root: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CalculatorService;

impl CalculatorService {
    fn sum(&self, _: &CallContext, request: SumRequest) -> Result<SumResponse, Status> {
        debug!("Sum invoked with {request:?}");
        let sum_result = request
            .first_number
            .checked_add(request.second_number)
            .ok_or_else(|| Status::invalid_argument("sum overflows a 32-bit integer"))?;
        Ok(SumResponse { sum_result })
    }

    fn prime_number_decomposition(
        &self,
        _: &CallContext,
        request: PrimeNumberDecompositionRequest,
        responses: &ResponseSink<PrimeNumberDecompositionResponse>,
    ) -> Result<(), Status> {
        debug!("PrimeNumberDecomposition invoked with {request:?}");
        let mut number = request.number;
        let mut divisor = 2i64;
        while number > 1 {
            if number % divisor == 0 {
                responses.send(PrimeNumberDecompositionResponse {
                    prime_factor: divisor,
                })?;
                number /= divisor;
            } else {
                divisor += 1;
                trace!("divisor has increased to {divisor}");
            }
        }
        Ok(())
    }

    fn compute_average(
        &self,
        _: &CallContext,
        requests: &mut RequestStream<ComputeAverageRequest>,
    ) -> Result<ComputeAverageResponse, Status> {
        let mut sum = 0i64;
        let mut count = 0u32;
        for request in requests {
            sum += i64::from(request?.number);
            count += 1;
        }
        if count == 0 {
            return Err(Status::invalid_argument(
                "cannot average an empty sequence of numbers",
            ));
        }
        Ok(ComputeAverageResponse {
            average: sum as f64 / f64::from(count),
        })
    }

    fn find_maximum(
        &self,
        _: &CallContext,
        requests: &mut RequestStream<FindMaximumRequest>,
        responses: &ResponseSink<FindMaximumResponse>,
    ) -> Result<(), Status> {
        let mut maximum: Option<i32> = None;
        for request in requests {
            let number = request?.number;
            if maximum.is_none_or(|max| number > max) {
                maximum = Some(number);
                responses.send(FindMaximumResponse { maximum: number })?;
            }
        }
        Ok(())
    }

    fn square_root(
        &self,
        _: &CallContext,
        request: SquareRootRequest,
    ) -> Result<SquareRootResponse, Status> {
        debug!("SquareRoot invoked with {request:?}");
        if request.number < 0 {
            return Err(Status::invalid_argument(format!(
                "Received a negative number: {}",
                request.number
            )));
        }
        Ok(SquareRootResponse {
            number_root: f64::from(request.number).sqrt(),
        })
    }
}

impl Service for CalculatorService {
    fn name(&self) -> &str {
        SERVICE
    }

    fn dispatch(&self, method: &str, call: IncomingCall) {
        match method {
            "Sum" => call.unary(|context, request| self.sum(context, request)),
            "PrimeNumberDecomposition" => call.server_streaming(|context, request, responses| {
                self.prime_number_decomposition(context, request, responses)
            }),
            "ComputeAverage" => call
                .client_streaming(|context, requests| self.compute_average(context, requests)),
            "FindMaximum" => call.bidi_streaming(|context, requests, responses| {
                self.find_maximum(context, requests, responses)
            }),
            "SquareRoot" => call.unary(|context, request| self.square_root(context, request)),
            _ => call.reject(Status::unimplemented(format!(
                "unknown method {SERVICE}/{method}"
            ))),
        }
    }
}

/// Typed calls to a remote [`CalculatorService`].
#[derive(Clone)]
pub struct CalculatorClient {
    client: Client,
}

impl CalculatorClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn sum(&self, request: SumRequest, deadline: Deadline) -> Result<SumResponse, Status> {
        self.client.call_unary(&method("Sum"), request, deadline)
    }

    pub fn prime_number_decomposition(
        &self,
        request: PrimeNumberDecompositionRequest,
        deadline: Deadline,
    ) -> Result<ResponseStream<PrimeNumberDecompositionResponse>, Status> {
        self.client
            .call_server_streaming(&method("PrimeNumberDecomposition"), request, deadline)
    }

    pub fn compute_average(
        &self,
        deadline: Deadline,
    ) -> Result<ClientStreamingCall<ComputeAverageRequest, ComputeAverageResponse>, Status> {
        self.client
            .call_client_streaming(&method("ComputeAverage"), deadline)
    }

    pub fn find_maximum(
        &self,
        deadline: Deadline,
    ) -> Result<(RequestSink<FindMaximumRequest>, ResponseStream<FindMaximumResponse>), Status>
    {
        self.client
            .call_bidi_streaming(&method("FindMaximum"), deadline)
    }

    pub fn square_root(
        &self,
        request: SquareRootRequest,
        deadline: Deadline,
    ) -> Result<SquareRootResponse, Status> {
        self.client
            .call_unary(&method("SquareRoot"), request, deadline)
    }
}

fn method(name: &str) -> String {
    format!("{SERVICE}/{name}")
}
