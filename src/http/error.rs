use rouille::Response;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    MethodNotAllowed(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::MethodNotAllowed(_) => 405,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ApiError::NotFound(msg) => Response::text(msg).with_status_code(status),
            ApiError::MethodNotAllowed(msg) => Response::text(msg)
                .with_status_code(status)
                .with_additional_header("Allow", "GET"),
        }
    }
}
