use std::sync::Arc;

use is_terminal::IsTerminal;
use kube::runtime::events::Recorder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::*;
use updates::UpdateGraph;

fn main() {
    use clap::{
        Arg, ArgAction, Command, ValueHint, crate_authors, crate_description, crate_name,
        crate_version,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run the operator").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("image")
                .long("base-image")
                .env("RELATED_IMAGE_SPICEDB")
                .help("container repository for SpiceDB containers if not specified in a CRD")
                .default_value(DEFAULT_BASE_IMAGE.to_string()),
            Arg::new("update_graph")
                .long("update-graph")
                .env("SPICEDB_UPDATE_GRAPH_FILE")
                .help("path to the update graph file")
                .value_hint(ValueHint::FilePath)
                .default_value("/etc/spicedb-operator/update-graph.yaml"),
            Arg::new("leader_elect")
                .long("leader-elect")
                .help("Flag for if leader election is needed. Currently does nothing.")
                .hide(true)
                .action(ArgAction::SetTrue),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    _leader_elect: bool,
    image: String,
    introspection_address: std::net::SocketAddr,
    update_graph: String,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            image: m.get_one::<String>("image").unwrap().clone(),
            introspection_address: m
                .get_one::<String>("introspection_address")
                .unwrap()
                .parse()?,
            _leader_elect: m.get_flag("leader_elect"),
            update_graph: m.get_one::<String>("update_graph").unwrap().clone(),
        })
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config.clone())?.build();

    let graph = UpdateGraph::load(&args.update_graph)?;
    info!(
        path = args.update_graph,
        channels = graph.channels.len(),
        "loaded update graph"
    );
    info!(image = args.image, "default base image set");

    let ctx = Arc::new(Context {
        recorder: Recorder::new(client.clone(), REPORTER.clone()),
        client,
        graph: Arc::new(graph),
        base_image: args.image,
    });

    info!("setup done, starting controller");
    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(clusters::controller(token.clone(), ctx)?);
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}
