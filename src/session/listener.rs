use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::Level::{Debug, Error, Info, Warn};

use crate::client_log;
use crate::session::protocol::ClientCommand;
use crate::session::{SessionContext, SessionState, StatusPush};

pub fn spawn(ctx: Arc<SessionContext>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("client-listener".to_string())
        .spawn(move || listen(&ctx))
}

fn listen(ctx: &SessionContext) {
    client_log!(Debug, "Listener thread started");
    let mut reader = ctx.lock_reader();

    while ctx.listener_should_run() {
        match reader.read_command() {
            Ok(command) => handle_command(ctx, command),
            Err(e) => {
                client_log!(Error, "Failed to read data from client: {}", e);
                ctx.set_state(SessionState::UnexpectedError);
                ctx.stop_listener();
            }
        }
    }

    client_log!(Info, "Closing listener thread");
}

fn handle_command(ctx: &SessionContext, command: ClientCommand) {
    match command {
        ClientCommand::Timeout => {}
        ClientCommand::Start => {
            client_log!(Info, "Client requested a new run");
            ctx.set_state(SessionState::StartRequested);
        }
        ClientCommand::RequestAbort => {
            if ctx.replace_state_if(SessionState::accepts_abort, SessionState::AbortRequested) {
                client_log!(Info, "Client requested abort");
            } else {
                client_log!(Debug, "Abort ignored in state {:?}", ctx.state());
            }
        }
        ClientCommand::RequestStatus => {
            if ctx.state().accepts_status_request() {
                client_log!(Debug, "Client requested status");
                ctx.push_status(StatusPush::Status);
            } else {
                client_log!(Debug, "Status request ignored in state {:?}", ctx.state());
            }
        }
        ClientCommand::Unrecognized(line) => {
            client_log!(Warn, "Received unknown message: {:?}", line);
        }
    }
}
