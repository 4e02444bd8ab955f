use std::fs;
use std::io::Read;

use procpipe::pipe::{
    write_or_sentinel_with, EndpointAccessor, ForeignEndpoint, ProcFsAccessor, SocketAccessor,
};

use crate::cmd::WriteArgs;
use crate::exit::{io_error, pipe_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_write, OutputFormat};

pub fn run(args: WriteArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;
    let accessor: Box<dyn EndpointAccessor> = match &args.socket {
        Some(path) => Box::new(SocketAccessor::new(path)),
        None => Box::new(ProcFsAccessor::new()),
    };

    let target = ForeignEndpoint::new(args.pid, args.fd);
    let written = if args.lossy {
        write_or_sentinel_with(accessor.as_ref(), target, &payload)
    } else {
        let written = accessor
            .write(target, &payload)
            .map_err(|err| pipe_error("write failed", err))?;
        isize::try_from(written)
            .map_err(|_| CliError::new(FAILURE, "write count out of range"))?
    };

    print_write(target, payload.len(), written, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &WriteArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }

    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .map_err(|err| io_error("failed reading stdin", err))?;
    Ok(buf)
}
