use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Video input connection string, e.g. rtsp://host:8554,topic=mystream
    #[arg(long, env = "FRAMESYNC_IN_VIDEO", default_value = "demo://video,topic=frames")]
    pub in_video: String,

    /// Message input connection strings; buffer_threshold=N enables the
    /// reorder window for that source. Repeatable.
    #[arg(long = "in-msg", env = "FRAMESYNC_IN_MSG", value_delimiter = ';')]
    pub in_msg: Vec<String>,

    /// Output connection string
    #[arg(long, env = "FRAMESYNC_OUT", default_value = "demo://out,topic=results")]
    pub out: String,

    /// Comma-separated compute devices, e.g. cuda:0,cuda:1 or cpu
    #[arg(long, env = "FRAMESYNC_DEVICES", default_value = "cpu", value_delimiter = ',')]
    pub devices: Vec<String>,

    #[arg(long, env = "FRAMESYNC_WORKERS_PER_DEVICE", default_value_t = 1)]
    pub num_workers_per_device: usize,

    /// Maximum number of pending (incomplete) correlation groups
    #[arg(long, default_value_t = 50)]
    pub pending_capacity: usize,

    /// Pending-group timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub group_timeout_ms: u64,

    /// Dispatch queue capacity
    #[arg(long, default_value_t = 100)]
    pub dispatch_capacity: usize,

    /// Drop tuples at a full dispatch queue instead of blocking
    #[arg(long, default_value_t = false)]
    pub drop_on_full: bool,

    /// Number of synthetic frames the demo sources generate
    #[arg(long, default_value_t = 200)]
    pub frames: u64,

    /// Exit after one full drain instead of running forever
    #[arg(long, env = "FRAMESYNC_RUN_UNTIL_COMPLETE", default_value_t = true)]
    pub run_until_complete: bool,

    /// Keep the process alive after pipeline start
    #[arg(long, env = "FRAMESYNC_DAEMON", default_value_t = false)]
    pub daemon_mode: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
