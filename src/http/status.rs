/// Reason phrases and short descriptions for the status codes this layer
/// speaks about, 100 through 505.
static STATUS_TABLE: phf::Map<u16, (&'static str, &'static str)> = phf::phf_map! {
    100u16 => ("Continue", "Request has been received and is being processed."),
    101u16 => ("Switching Protocols", "Switching to new protocol."),
    200u16 => ("OK", "Request fulfilled, document follows."),
    201u16 => ("Created", "Document created, URL follows."),
    202u16 => ("Accepted", "Request accepted, processing continues off-line."),
    203u16 => ("Non-Authoritative Information", "Request fulfilled from cache."),
    204u16 => ("No Content", "Request fulfilled, nothing follows."),
    205u16 => ("Reset Content", "Clear input form for further input."),
    206u16 => ("Partial Content", "Partial content follows."),
    300u16 => ("Multiple Choices", "Object has several resources -- see URI list."),
    301u16 => ("Moved Permanently", "Object moved permanently -- see URI list."),
    302u16 => ("Found", "Object moved temporarily -- see URI list."),
    303u16 => ("See Other", "Object moved -- see Method and URL list."),
    304u16 => ("Not Modified", "Document has not changed since given time."),
    305u16 => ("Use Proxy", "You must use proxy specified in Location."),
    307u16 => ("Temporary Redirect", "Object moved temporarily -- see URI list."),
    308u16 => ("Permanent Redirect", "Object moved permanently -- see URI list."),
    400u16 => ("Bad Request", "Bad request syntax or unsupported method."),
    401u16 => ("Unauthorized", "No permission -- see authorization schemes."),
    402u16 => ("Payment Required", "No payment -- see charging schemes."),
    403u16 => ("Forbidden", "Request forbidden -- authorization will not help."),
    404u16 => ("Not Found", "Document not found."),
    405u16 => ("Method Not Allowed", "Method not allowed for this resource."),
    406u16 => ("Not Acceptable", "Cannot generate response -- client may not support media type."),
    407u16 => ("Proxy Authentication Required", "You must authenticate with this proxy."),
    408u16 => ("Request Timeout", "Request timed out; try again later."),
    409u16 => ("Conflict", "Request conflict."),
    410u16 => ("Gone", "URI no longer exists and has been permanently removed."),
    411u16 => ("Length Required", "Client must specify Content-Length."),
    412u16 => ("Precondition Failed", "Precondition in headers is false."),
    413u16 => ("Request Entity Too Large", "Entity is too large."),
    414u16 => ("Request-URI Too Long", "URI is too long."),
    415u16 => ("Unsupported Media Type", "Entity body in unsupported format."),
    416u16 => ("Requested Range Not Satisfiable", "Cannot satisfy request range."),
    417u16 => ("Expectation Failed", "Expect condition could not be satisfied."),
    422u16 => ("Unprocessable Entity", "Unprocessable entity."),
    423u16 => ("Locked", "Locked."),
    424u16 => ("Failed Dependency", "Failed dependency."),
    426u16 => ("Upgrade Required", "Client should upgrade to use new protocol."),
    428u16 => ("Precondition Required", "Precondition in headers is false."),
    429u16 => ("Too Many Requests", "Too many requests."),
    431u16 => ("Request Header Fields Too Large", "Request header fields too large."),
    500u16 => ("Internal Server Error", "Server got itself in trouble."),
    501u16 => ("Not Implemented", "Server does not support this operation."),
    502u16 => ("Bad Gateway", "Invalid responses from another server/proxy."),
    503u16 => ("Service Unavailable", "The server cannot process the request due to a high load."),
    504u16 => ("Gateway Timeout", "The gateway server did not receive a timely response."),
    505u16 => ("HTTP Version Not Supported", "Cannot fulfill request."),
};

pub fn reason_phrase(code: u16) -> Option<&'static str> {
    STATUS_TABLE.get(&code).map(|(reason, _)| *reason)
}

pub fn description(code: u16) -> Option<&'static str> {
    STATUS_TABLE.get(&code).map(|(_, description)| *description)
}
