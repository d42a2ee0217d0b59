use crate::transport::registry::{CliPlugin, TrackCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct StreamCliPlugin;

impl StreamCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for StreamCliPlugin {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("stream_disabled")
                .long("no-stream")
                .help_heading("Streaming")
                .help("Skip the event stream and poll for status")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stream_idle_timeout_secs")
                .long("idle-timeout-secs")
                .help_heading("Streaming")
                .help("Reconnect when the stream is silent this long (0 disables)")
                .default_value("60")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("stream_max_reconnects")
                .long("max-reconnects")
                .help_heading("Streaming")
                .help("Consecutive failed connects before falling back to polling")
                .default_value("3")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("stream_reconnect_delay_ms")
                .long("reconnect-delay-ms")
                .help_heading("Streaming")
                .help("Delay before reconnecting, unless the server sends retry:")
                .default_value("3000")
                .global(true)
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut TrackCliConfig) -> anyhow::Result<()> {
        let ctx = &mut cfg.client_ctx;
        ctx.prefer_stream = !matches.get_flag("stream_disabled");
        if let Some(s) = matches.get_one::<String>("stream_idle_timeout_secs") {
            ctx.idle_timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("stream_max_reconnects") {
            ctx.max_reconnects = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("stream_reconnect_delay_ms") {
            ctx.reconnect_delay_ms = s.parse()?;
        }
        Ok(())
    }
}
