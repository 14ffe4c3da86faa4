use clap::{Arg, Command};
use defnet::logging::{LogConfig, LogOutput, init_logging, level_for_verbosity, parse_log_level};
use defnet::{ScenarioConfig, SimulationEngine};
use tracing::{error, info};

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("defnet")
        .version("0.1.0")
        .about("砲台・レーダー連携ネットワーク (Defense Network)")
        .long_about(
            "損失のある無線ネットワーク上で砲台・レーダー・指揮ノードを連携させる\n\
             プロトコルのシミュレータです。シナリオに従ってノードを起動し、\n\
             射撃指示と応答、コンタクト通知、ハートビートを再現します。",
        )
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help(
                    "実行するシナリオファイル(.yaml)のパスを指定します。\n\
                     指定しない場合は使用方法を表示して終了します。",
                ),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
                .conflicts_with("realtime"),
        )
        .arg(
            Arg::new("realtime")
                .long("realtime")
                .action(clap::ArgAction::SetTrue)
                .help("時間刻みごとに実時間で待機しながら実行"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: デバッグ)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("ログレベル (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("OUTPUT")
                .default_value("console")
                .value_parser(clap::builder::ValueParser::new(|s: &str| s.parse::<LogOutput>()))
                .help("ログ出力先 (console, file, both)"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("logs")
                .help("ログファイルの出力ディレクトリ"),
        )
        .get_matches();

    println!("砲台・レーダー連携ネットワーク (Defense Network) - defnet v0.1.0");
    println!();

    // 詳細レベルの設定
    let verbose_level = matches.get_count("verbose");
    if verbose_level > 0 {
        println!("詳細出力レベル: {}", verbose_level);
    }

    // ログの初期化
    let base_level = matches
        .get_one::<String>("log-level")
        .map(|s| parse_log_level(s))
        .unwrap_or(tracing::Level::INFO);
    let log_config = LogConfig {
        level: level_for_verbosity(base_level, verbose_level.saturating_sub(1)),
        output: matches.get_one::<LogOutput>("log-output").copied().unwrap_or(LogOutput::Console),
        log_dir: matches
            .get_one::<String>("log-dir")
            .cloned()
            .unwrap_or_else(|| "logs".to_string()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ログの初期化に失敗しました: {}", e);
            std::process::exit(1);
        }
    };

    // シナリオファイルの処理
    if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        let options = RunOptions {
            info_only: matches.get_flag("info"),
            realtime: matches.get_flag("realtime"),
            verbose_level,
        };
        match run_scenario(scenario_path, options) {
            Ok(_) => {
                if verbose_level > 0 {
                    println!("シナリオ実行が正常に完了しました。");
                }
            }
            Err(e) => {
                error!("シナリオ実行に失敗: {}", e);
                eprintln!("エラー: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        show_default_help();
    }
}

struct RunOptions {
    info_only: bool,
    realtime: bool,
    verbose_level: u8,
}

/// シナリオファイルを読み込んで実行
fn run_scenario(scenario_path: &str, options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    // シナリオファイルの読み込み
    let scenario = ScenarioConfig::from_file(scenario_path)?;
    info!("シナリオファイル読み込み完了: {}", scenario_path);

    // 情報表示のみの場合
    if options.info_only {
        scenario.print_summary();
        return Ok(());
    }

    scenario.print_summary();
    println!();

    // シミュレーションエンジンの作成と初期化
    let mut simulation = SimulationEngine::new(scenario, options.verbose_level);
    simulation.initialize()?;

    // シミュレーション実行
    if options.realtime {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        runtime.block_on(simulation.run_realtime());
    } else {
        simulation.run();
    }

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  defnet [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>   シナリオファイルを指定して実行");
    println!("  -i, --info              シナリオ情報のみ表示");
    println!("      --realtime          実時間で実行");
    println!("  -v, --verbose           詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-level <LEVEL> ログレベル");
    println!("      --log-output <OUT>  ログ出力先 (console, file, both)");
    println!("      --log-dir <DIR>     ログ出力ディレクトリ");
    println!("  -h, --help              このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/basic_network.yaml - 指揮所・砲台3ノード・レーダーの基本構成");
    println!();
    println!("例:");
    println!("  defnet -s scenarios/basic_network.yaml");
    println!("  defnet -s scenarios/basic_network.yaml -i");
    println!("  defnet -s scenarios/basic_network.yaml -vv --log-output both");
}
