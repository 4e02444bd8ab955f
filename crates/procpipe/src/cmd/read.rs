use procpipe::pipe::{
    read_or_empty_with, EndpointAccessor, ForeignEndpoint, ProcFsAccessor, SocketAccessor,
};

use crate::cmd::ReadArgs;
use crate::exit::{pipe_error, CliResult, SUCCESS};
use crate::output::{print_chunk, OutputFormat};

pub fn run(args: ReadArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.buffer.config();
    let accessor: Box<dyn EndpointAccessor> = match &args.socket {
        Some(path) => Box::new(
            SocketAccessor::with_config(path, config)
                .map_err(|err| pipe_error("invalid configuration", err))?,
        ),
        None => Box::new(
            ProcFsAccessor::with_config(config)
                .map_err(|err| pipe_error("invalid configuration", err))?,
        ),
    };

    let source = ForeignEndpoint::new(args.pid, args.fd);
    let chunk = if args.lossy {
        read_or_empty_with(accessor.as_ref(), source)
    } else {
        accessor
            .read(source)
            .map_err(|err| pipe_error("read failed", err))?
    };

    print_chunk(source, &chunk, format);
    Ok(SUCCESS)
}
