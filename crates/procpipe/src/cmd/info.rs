use procpipe::pipe::registry;

use crate::cmd::InfoArgs;
use crate::exit::{pipe_error, CliResult, SUCCESS};
use crate::output::{print_identity, OutputFormat};

/// The pipe only lives as long as this command, so the identity is mainly
/// useful to check that pipes can be created here and what they look like.
pub fn run(_args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let context = registry::instance().map_err(|err| pipe_error("pipe creation failed", err))?;
    print_identity(&context.identity(), format);
    Ok(SUCCESS)
}
