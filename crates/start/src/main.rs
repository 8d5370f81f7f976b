//! Single-binary entrypoint: initialize logging and hand off to the
//! service crate's blocking `start_server`. There is only one process
//! here, so there is nothing to supervise.

fn main() {
    env_logger::init();
    if let Err(err) = acctrelay_service::start_server() {
        log::error!("event=service_stopped error={err}");
        std::process::exit(1);
    }
}
