use super::body::Body;
use super::header::Headers;
use super::method::Method;

/// A parsed request head plus its streaming body. The body is populated
/// separately once the caller knows where bytes should spill to.
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub proto: String,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Serializes the request line and headers (not the body) into `out`.
    pub fn write_head_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.proto.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
    }
}
