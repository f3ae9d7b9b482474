mod common;
mod http_output;
mod routing;
mod tcp_output;
