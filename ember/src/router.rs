// src/router.rs
//! `(method, exact path)` handler registry with a static-file fallback.
//!
//! The map lock covers only registration and lookup; handlers always run
//! with the lock released and may block however they like.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::http::{HttpRequest, HttpResponse, Method};
use crate::parser::ParseCode;
use crate::store::UserStore;
use crate::sync::lock_or_recover;

pub type RouteHandler =
    Arc<dyn Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync>;

pub struct Router {
    routes: Mutex<HashMap<(Method, String), RouteHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_route<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync + 'static,
    {
        lock_or_recover(&self.routes).insert((method, path.to_string()), Arc::new(handler));
    }

    pub fn get<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync + 'static,
    {
        self.add_route(Method::Get, path, handler);
    }

    pub fn post<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync + 'static,
    {
        self.add_route(Method::Post, path, handler);
    }

    pub fn put<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync + 'static,
    {
        self.add_route(Method::Put, path, handler);
    }

    pub fn delete<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &mut dyn UserStore) + Send + Sync + 'static,
    {
        self.add_route(Method::Delete, path, handler);
    }

    fn lookup(&self, method: Method, path: &str) -> Option<RouteHandler> {
        lock_or_recover(&self.routes)
            .get(&(method, path.to_string()))
            .cloned()
    }

    /// Dispatch a complete request: a registered handler first, then the
    /// static-file renderer, else the not-found code the connection turns
    /// into the canonical error page.
    pub fn handle(
        &self,
        req: &HttpRequest,
        res: &mut HttpResponse,
        store: &mut dyn UserStore,
    ) -> ParseCode {
        if let Some(handler) = self.lookup(req.method, &req.path) {
            handler(req, res, store);
            if res.prepared() {
                return ParseCode::FileRequest;
            }
            // The handler's send/render failed; report the file as gone.
            return ParseCode::NoResource;
        }
        match res.render(200, &req.path) {
            Ok(()) => ParseCode::FileRequest,
            Err(err) => err.code(),
        }
    }

    pub fn route_count(&self) -> usize {
        lock_or_recover(&self.routes).len()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;

    fn request(method: Method, path: &str) -> HttpRequest {
        HttpRequest {
            method,
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            host: None,
            keep_alive: false,
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            body: Vec::new(),
        }
    }

    fn response_text(res: &HttpResponse) -> String {
        let (head, tail) = res.pending_slices();
        let mut text = String::from_utf8_lossy(head).into_owned();
        text.push_str(&String::from_utf8_lossy(tail));
        text
    }

    #[test]
    fn registered_handler_wins() {
        let router = Router::new();
        router.get("/hello", |_req: &HttpRequest, res: &mut HttpResponse, _store: &mut dyn UserStore| {
            res.send(200, "hello there");
        });
        assert_eq!(router.route_count(), 1);

        let mut res = HttpResponse::new(PathBuf::from("/nonexistent"));
        res.reset(false);
        let mut store = MemoryStore::new();
        let code = router.handle(&request(Method::Get, "/hello"), &mut res, &mut store);
        assert_eq!(code, ParseCode::FileRequest);
        assert!(response_text(&res).ends_with("hello there"));
    }

    #[test]
    fn method_is_part_of_the_key() {
        let router = Router::new();
        router.post("/only-post", |_req: &HttpRequest, res: &mut HttpResponse, _store: &mut dyn UserStore| {
            res.send(200, "ok");
        });
        let mut res = HttpResponse::new(PathBuf::from("/nonexistent"));
        res.reset(false);
        let mut store = MemoryStore::new();
        let code = router.handle(&request(Method::Get, "/only-post"), &mut res, &mut store);
        assert_eq!(code, ParseCode::NoResource);
    }

    #[test]
    fn falls_back_to_static_render() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("about.html"))
            .unwrap()
            .write_all(b"about page")
            .unwrap();

        let router = Router::new();
        let mut res = HttpResponse::new(dir.path().to_path_buf());
        res.reset(false);
        let mut store = MemoryStore::new();
        let code = router.handle(&request(Method::Get, "/about.html"), &mut res, &mut store);
        assert_eq!(code, ParseCode::FileRequest);
        assert!(response_text(&res).ends_with("about page"));
    }

    #[test]
    fn missing_everything_is_no_resource() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new();
        let mut res = HttpResponse::new(dir.path().to_path_buf());
        res.reset(false);
        let mut store = MemoryStore::new();
        let code = router.handle(&request(Method::Get, "/nowhere"), &mut res, &mut store);
        assert_eq!(code, ParseCode::NoResource);
    }

    #[test]
    fn handlers_can_use_the_store() {
        let router = Router::new();
        router.post("/signup", |req: &HttpRequest, res: &mut HttpResponse, store: &mut dyn UserStore| {
            let name = req.form_value("user").unwrap_or_default();
            let pass = req.form_value("passwd").unwrap_or_default();
            match store.insert_user(name, pass) {
                Ok(true) => res.send(200, "registered"),
                _ => res.send(200, "taken"),
            };
        });

        let mut store = MemoryStore::new();
        let mut res = HttpResponse::new(PathBuf::from("/nonexistent"));
        res.reset(false);
        let mut req = request(Method::Post, "/signup");
        req.body = b"user=n&passwd=p".to_vec();

        router.handle(&req, &mut res, &mut store);
        assert!(response_text(&res).ends_with("registered"));

        router.handle(&req, &mut res, &mut store);
        assert!(response_text(&res).ends_with("taken"));
    }
}
