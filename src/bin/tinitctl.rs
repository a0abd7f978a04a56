//! Command-line client for the control-plane socket, grounded in SPEC_FULL.md §6 and following
//! the teacher's `vctl`-style thin-client binaries: parse argv by hand, connect a datagram
//! socket, encode a request, block for one reply, print it.

use std::path::PathBuf;

use tinit::protocol::{MsgType, Reply, Request};

const RUN_DIR: &str = "/run";

fn usage() -> ! {
    eprintln!(
        "usage: tinitctl <status|start|stop|restart|reload|switch> [pattern]\n\
         \n\
         status [pattern]   show matching services (default: *)\n\
         start <pattern>     mark matching services administratively on\n\
         stop <pattern>      mark matching services administratively off\n\
         restart <pattern>   no-op placeholder, reserved for future use\n\
         reload <pattern>    send the configured reload signal to matching services\n\
         switch <target>     switch the active target"
    );
    std::process::exit(2);
}

fn run_state_name(v: u8) -> &'static str {
    match v {
        0 => "stopped",
        1 => "starting",
        2 => "ready",
        3 => "stopping",
        _ => "unknown",
    }
}

fn print_status(records: &[tinit::protocol::StatusRecord]) {
    println!("{:<24} {:>8} {:<5} {:<9}", "ORIGIN", "PID", "ADMIN", "STATE");
    for rec in records {
        println!(
            "{:<24} {:>8} {:<5} {:<9}",
            rec.origin,
            rec.pid,
            if rec.admin_on { "on" } else { "off" },
            run_state_name(rec.run_state),
        );
    }
}

fn connect() -> std::io::Result<std::os::unix::net::UnixDatagram> {
    let socket = std::os::unix::net::UnixDatagram::unbound()?;
    let server_path = PathBuf::from(RUN_DIR).join(tinit::protocol::SOCK_NAME);
    socket.connect(&server_path)?;
    Ok(socket)
}

fn send_request(request: &Request) -> std::io::Result<Reply> {
    let socket = connect()?;
    socket.send(&request.encode())?;
    let mut buf = vec![0u8; tinit::protocol::MSG_SIZE_MAX];
    let n = socket.recv(&mut buf)?;
    buf.truncate(n);
    Reply::decode(&buf).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let (kind, pattern) = match args[0].as_str() {
        "status" => (MsgType::Status, args.get(1).cloned().unwrap_or_else(|| "*".to_owned())),
        "start" => (MsgType::Start, args.get(1).cloned().unwrap_or_else(|| usage())),
        "stop" => (MsgType::Stop, args.get(1).cloned().unwrap_or_else(|| usage())),
        "restart" => (MsgType::Restart, args.get(1).cloned().unwrap_or_else(|| usage())),
        "reload" => (MsgType::Reload, args.get(1).cloned().unwrap_or_else(|| usage())),
        "switch" => (MsgType::Switch, args.get(1).cloned().unwrap_or_else(|| usage())),
        _ => usage(),
    };

    if pattern.len() > tinit::protocol::PATTERN_MAX {
        eprintln!("tinitctl: pattern too long");
        std::process::exit(1);
    }

    let request = Request { seq: 1, kind, pattern };
    match send_request(&request) {
        Ok(Reply::Status { ret, records, .. }) => {
            if ret != 0 {
                eprintln!("tinitctl: request failed: {ret}");
                std::process::exit(1);
            }
            print_status(&records);
        }
        Ok(Reply::Named { ret, .. }) => {
            if ret != 0 {
                eprintln!("tinitctl: request failed: {ret}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("tinitctl: {err}");
            std::process::exit(1);
        }
    }
}
