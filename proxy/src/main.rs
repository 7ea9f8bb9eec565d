use std::process::ExitCode;

fn main() -> ExitCode {
	socks5_proxy::run(std::env::args())
}
