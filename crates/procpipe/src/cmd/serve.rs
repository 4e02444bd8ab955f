use std::path::PathBuf;
use std::thread;

use procpipe::pipe::{DescriptorBroker, PipeContext};
use tracing::{debug, info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{pipe_error, CliError, CliResult, SUCCESS};
use crate::output::{print_chunk, print_identity, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let context = PipeContext::with_config(args.buffer.config())
        .map_err(|err| pipe_error("pipe creation failed", err))?;

    let broker = match &args.broker {
        Some(path) => {
            Some(DescriptorBroker::bind(path).map_err(|err| pipe_error("broker bind failed", err))?)
        }
        None => None,
    };
    let _cleanup = args.broker.clone().map(SocketCleanup);
    install_ctrlc_handler(args.broker.clone())?;

    let identity = context.identity();
    info!(
        pid = identity.pid,
        read_fd = identity.read_fd,
        write_fd = identity.write_fd,
        "serving pipe"
    );
    print_identity(&identity, format);

    if let Some(broker) = broker {
        spawn_broker(broker, context.clone());
    }

    if args.hold {
        loop {
            thread::park();
        }
    }

    let source = identity.read_end();
    let mut printed = 0usize;
    loop {
        let chunk = context
            .read()
            .map_err(|err| pipe_error("read failed", err))?;
        if chunk.is_empty() {
            debug!("pipe reached end of stream");
            break;
        }

        print_chunk(source, &chunk, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    Ok(SUCCESS)
}

/// Answer descriptor requests until the process exits.
fn spawn_broker(broker: DescriptorBroker, context: PipeContext) {
    thread::spawn(move || loop {
        match broker.serve_one(context.pipe()) {
            Ok(outcome) => debug!(?outcome, "broker request handled"),
            Err(err) => warn!(error = %err, "broker request failed"),
        }
    });
}

/// The broker lives on a detached thread, so its own cleanup never runs.
struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn install_ctrlc_handler(broker_path: Option<PathBuf>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        if let Some(path) = &broker_path {
            let _ = std::fs::remove_file(path);
        }
        // A blocked pipe read cannot be interrupted, so leave from here.
        std::process::exit(SUCCESS);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
