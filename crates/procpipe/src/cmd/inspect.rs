use procpipe::pipe::{inspect, ForeignEndpoint};

use crate::cmd::InspectArgs;
use crate::exit::{pipe_error, CliResult, SUCCESS};
use crate::output::{print_endpoint_info, OutputFormat};

pub fn run(args: InspectArgs, format: OutputFormat) -> CliResult<i32> {
    let target = ForeignEndpoint::new(args.pid, args.fd);
    let info = inspect(target).map_err(|err| pipe_error("inspect failed", err))?;
    print_endpoint_info(&info, format);
    Ok(SUCCESS)
}
