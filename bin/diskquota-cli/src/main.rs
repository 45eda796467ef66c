//! Diskquota CLI - Admin Command Line Interface
//!
//! Administrative commands for the diskquota coordinator.

use anyhow::Result;
use clap::{Parser, Subcommand};
use diskquota_common::{DdlResult, QuotaType};
use diskquota_proto::manage::{
    management_service_client::ManagementServiceClient, DatabaseRequest,
    ManageRelationSizeRequest, SetPerSegmentQuotaRequest, SetQuotaRequest,
    SetTablespaceQuotaRequest, ShowQuotaRequest,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "diskquota-cli")]
#[command(about = "Diskquota Admin CLI")]
#[command(version)]
struct Args {
    /// Coordinator management endpoint
    #[arg(short, long, default_value = "http://localhost:9101")]
    endpoint: String,

    /// Target database
    #[arg(short, long, default_value = "postgres")]
    database: String,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start quota monitoring for the database
    Enable,
    /// Stop quota monitoring for the database
    Disable,
    /// Set a schema quota, e.g. `set-schema-quota sales "1 GB"`
    SetSchemaQuota { schema: String, size: String },
    /// Set a role quota
    SetRoleQuota { role: String, size: String },
    /// Set a schema quota on one tablespace
    SetSchemaTablespaceQuota {
        schema: String,
        tablespace: String,
        size: String,
    },
    /// Set a role quota on one tablespace
    SetRoleTablespaceQuota {
        role: String,
        tablespace: String,
        size: String,
    },
    /// Set the per-segment ratio for a tablespace
    SetPerSegmentQuota { tablespace: String, ratio: f32 },
    /// Pause enforcement (sizes keep refreshing)
    Pause,
    /// Resume enforcement
    Resume,
    /// Recompute and persist all table sizes
    InitTableSizeTable,
    /// Block until the worker completes another epoch
    WaitForNewEpoch,
    /// Cluster-wide on-disk size of one relation
    RelationSize { relation: String },
    /// Show configured quotas and current usage
    ShowQuota {
        /// One of: schema, role, schema-tablespace, role-tablespace
        #[arg(default_value = "schema")]
        kind: String,
    },
    /// Worker and blocklist status
    Status,
}

fn quota_type_arg(kind: &str) -> Result<QuotaType> {
    match kind {
        "schema" => Ok(QuotaType::Schema),
        "role" => Ok(QuotaType::Role),
        "schema-tablespace" => Ok(QuotaType::SchemaTablespace),
        "role-tablespace" => Ok(QuotaType::RoleTablespace),
        other => anyhow::bail!(
            "unknown quota kind \"{other}\" (expected schema, role, schema-tablespace or role-tablespace)"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut client = ManagementServiceClient::connect(args.endpoint.clone()).await?;
    let database = args.database.clone();
    let db_request = DatabaseRequest {
        database: database.clone(),
    };

    match args.command {
        Commands::Enable => {
            let resp = client.enable_database(db_request).await?.into_inner();
            if resp.result == DdlResult::Ok as u32 {
                println!("quota monitoring enabled for {database}");
                if !resp.message.is_empty() && resp.message != DdlResult::Ok.describe() {
                    println!("note: {}", resp.message);
                }
            } else {
                anyhow::bail!("enable failed: {}", resp.message);
            }
        }
        Commands::Disable => {
            let resp = client.disable_database(db_request).await?.into_inner();
            if resp.result == DdlResult::Ok as u32 {
                println!("quota monitoring disabled for {database}");
            } else {
                anyhow::bail!("disable failed: {}", resp.message);
            }
        }
        Commands::SetSchemaQuota { schema, size } => {
            client
                .set_schema_quota(SetQuotaRequest {
                    database,
                    target: schema,
                    size,
                })
                .await?;
            println!("ok");
        }
        Commands::SetRoleQuota { role, size } => {
            client
                .set_role_quota(SetQuotaRequest {
                    database,
                    target: role,
                    size,
                })
                .await?;
            println!("ok");
        }
        Commands::SetSchemaTablespaceQuota {
            schema,
            tablespace,
            size,
        } => {
            client
                .set_schema_tablespace_quota(SetTablespaceQuotaRequest {
                    database,
                    target: schema,
                    tablespace,
                    size,
                })
                .await?;
            println!("ok");
        }
        Commands::SetRoleTablespaceQuota {
            role,
            tablespace,
            size,
        } => {
            client
                .set_role_tablespace_quota(SetTablespaceQuotaRequest {
                    database,
                    target: role,
                    tablespace,
                    size,
                })
                .await?;
            println!("ok");
        }
        Commands::SetPerSegmentQuota { tablespace, ratio } => {
            client
                .set_per_segment_quota(SetPerSegmentQuotaRequest {
                    database,
                    tablespace,
                    ratio,
                })
                .await?;
            println!("ok");
        }
        Commands::Pause => {
            client.pause(db_request).await?;
            println!("paused");
        }
        Commands::Resume => {
            client.resume(db_request).await?;
            println!("resumed");
        }
        Commands::InitTableSizeTable => {
            let resp = client.init_table_size_table(db_request).await?.into_inner();
            println!("initialized sizes for {} relations", resp.relations);
        }
        Commands::WaitForNewEpoch => {
            let resp = client
                .wait_for_worker_new_epoch(db_request)
                .await?
                .into_inner();
            println!("epoch {}", resp.epoch);
        }
        Commands::RelationSize { relation } => {
            let resp = client
                .relation_size(ManageRelationSizeRequest { database, relation })
                .await?
                .into_inner();
            println!("{}", resp.size_bytes);
        }
        Commands::ShowQuota { kind } => {
            let quota_type = quota_type_arg(&kind)?;
            let resp = client
                .show_quota(ShowQuotaRequest {
                    database,
                    quota_type: quota_type as u32,
                })
                .await?
                .into_inner();
            if resp.rows.is_empty() {
                println!("no {kind} quotas configured");
            } else {
                println!(
                    "{:<24} {:<16} {:>12} {:>16}",
                    "TARGET", "TABLESPACE", "QUOTA (MB)", "USED (BYTES)"
                );
                for row in resp.rows {
                    println!(
                        "{:<24} {:<16} {:>12} {:>16}",
                        row.target_name,
                        if row.tablespace_name.is_empty() {
                            "-"
                        } else {
                            row.tablespace_name.as_str()
                        },
                        row.quota_mb,
                        row.used_bytes
                    );
                }
            }
        }
        Commands::Status => {
            let resp = client.status(db_request).await?.into_inner();
            println!("epoch:      {}", resp.epoch);
            println!("paused:     {}", resp.paused);
            println!("ready:      {}", resp.ready);
            println!("blocklist:  {} entries", resp.blocklist_len);
            println!("monitored:  {:?}", resp.monitored_dbs);
        }
    }

    Ok(())
}
