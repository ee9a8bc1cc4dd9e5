use log::{debug, info};
use rouille::{Request, Response, ResponseBody};
use std::{io::Cursor, sync::Arc};

use crate::{artwork::store::ArtworkStore, config::HttpConfig, http::error::ApiError};

/// Serves the current and default artwork to the display.
pub struct HttpServer {
    store: Arc<ArtworkStore>,
    pub config: HttpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Image {
    CurrentJpeg,
    CurrentPng,
    DefaultJpeg,
    DefaultPng,
}

impl Image {
    fn content_type(self) -> &'static str {
        match self {
            Image::CurrentJpeg | Image::DefaultJpeg => "image/jpeg",
            Image::CurrentPng | Image::DefaultPng => "image/png",
        }
    }
}

impl HttpServer {
    pub fn new(store: Arc<ArtworkStore>, config: HttpConfig) -> Self {
        Self { store, config }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    pub fn run(self) {
        let addr = self.addr();
        info!(
            "HTTP server running at http://{addr}{} (png at {})",
            self.config.jpeg_path, self.config.png_path
        );
        rouille::start_server(addr, move |request| self.handle_request(request));
    }

    fn handle_request(&self, request: &Request) -> Response {
        Self::log_request(request);

        let response = match self.serve(request) {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };

        debug!(
            "Response: {} {} {}",
            request.method(),
            request.url(),
            response.status_code
        );
        response
    }

    fn log_request(request: &Request) {
        debug!("{} {} from {}", request.method(), request.url(), request.remote_addr());
    }

    fn serve(&self, request: &Request) -> Result<Response, ApiError> {
        let url = request.url();
        let image = self
            .route(&url)
            .ok_or_else(|| ApiError::NotFound(format!("{url} not found")))?;
        if request.method() != "GET" {
            return Err(ApiError::MethodNotAllowed(format!(
                "{} not allowed on {url}",
                request.method()
            )));
        }

        if matches!(image, Image::CurrentJpeg | Image::CurrentPng) {
            match self.store.current_hash() {
                Some(hash) => debug!("serving artwork {}", hash.short()),
                None => debug!("no artwork yet, serving default"),
            }
        }

        let bytes = match image {
            Image::CurrentJpeg => self.store.current_jpeg(),
            Image::CurrentPng => self.store.current_png(),
            Image::DefaultJpeg => self.store.default_jpeg(),
            Image::DefaultPng => self.store.default_png(),
        };
        Ok(Self::image_response(image.content_type(), bytes))
    }

    fn route(&self, url: &str) -> Option<Image> {
        let config = &self.config;
        [
            (&config.jpeg_path, Image::CurrentJpeg),
            (&config.png_path, Image::CurrentPng),
            (&config.default_jpeg_path, Image::DefaultJpeg),
            (&config.default_png_path, Image::DefaultPng),
        ]
        .into_iter()
        .find(|(path, _)| path.as_str() == url)
        .map(|(_, image)| image)
    }

    fn image_response(content_type: &'static str, bytes: Arc<[u8]>) -> Response {
        let len = bytes.len();
        Response {
            status_code: 200,
            headers: vec![("Content-Type".into(), content_type.into())],
            data: ResponseBody::from_reader_and_size(Cursor::new(bytes), len),
            upgrade: None,
        }
        .with_no_cache()
    }
}
