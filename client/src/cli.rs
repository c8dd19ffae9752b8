use std::{collections::BTreeMap, env};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    CancelResponse, ClusterConnection, JobInfo, JobLogsResponse, JobRequest, JobResults,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar y seguir cálculos de mapas de ruido")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job nuevo
    Submit(SubmitArgs),
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista todos los jobs
    List,
    /// Pide la cancelación de un job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Borra un job y su directorio de trabajo, cancelándolo si sigue en curso
    Delete {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Muestra el log de un job
    Logs {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Sólo las últimas N líneas
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Lista las tablas fusionadas de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(value_name = "NOMBRE")]
    name: String,

    /// Conjunto de datos a importar
    #[arg(long)]
    dataset: String,

    /// Configuración del algoritmo
    #[arg(long, default_value_t = 1)]
    config_id: i64,

    /// Id propio para el job (si no, lo genera el master)
    #[arg(long)]
    id: Option<String>,

    /// Repartir el cálculo en el cluster
    #[arg(long)]
    cluster: bool,

    /// Host del cluster (si no, se usa el configurado en el master)
    #[arg(long, requires = "user")]
    host: Option<String>,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(long)]
    user: Option<String>,

    /// Clave privada para el cluster
    #[arg(long, default_value = "")]
    identity_file: String,

    /// Tipo y clave pública del host en la que se confía (ej: ssh-ed25519 AAAA...)
    #[arg(long, requires = "host_key")]
    host_key_type: Option<String>,

    #[arg(long, requires = "host_key_type")]
    host_key: Option<String>,

    /// Parámetro extra `clave=valor` (el valor se lee como JSON si se puede)
    #[arg(long = "param", value_name = "CLAVE=VALOR")]
    params: Vec<String>,
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("parámetro inválido {raw:?}, se espera clave=valor");
    };
    if key.is_empty() {
        bail!("parámetro sin nombre: {raw:?}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_request(args: SubmitArgs) -> Result<JobRequest> {
    let params = args
        .params
        .iter()
        .map(|raw| parse_param(raw))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let cluster = match (args.host, args.user) {
        (Some(host), Some(user)) => Some(ClusterConnection {
            host,
            port: args.port,
            user,
            identity_file: args.identity_file,
            host_key_type: args.host_key_type,
            host_key: args.host_key,
        }),
        _ => None,
    };

    Ok(JobRequest {
        id: args.id,
        name: args.name,
        dataset: args.dataset,
        configuration_id: args.config_id,
        compute_on_cluster: args.cluster || cluster.is_some(),
        cluster,
        params,
    })
}

async fn read_json<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        bail!("{what}: el master respondió {status}");
    }
    resp.json().await.with_context(|| format!("{what}: respuesta inválida"))
}

fn print_job(job: &JobInfo) {
    println!("Job {}", job.id);
    println!("  nombre    : {}", job.name);
    println!("  estado    : {}", job.state);
    println!("  progreso  : {:.1}%", job.progress_percent);
    println!("  dataset   : {}", job.request.dataset);
    println!(
        "  modo      : {}",
        if job.request.compute_on_cluster { "cluster" } else { "local" }
    );
    println!("  enviado   : {}", job.submitted_at);
    if let Some(begin) = job.begin_time {
        println!("  iniciado  : {begin}");
    }
    if let Some(end) = job.end_time {
        println!("  finalizado: {end}");
    }
    if let Some(remote) = &job.remote_job_id {
        println!("  id remoto : {remote}");
    }
    println!("  directorio: {}", job.working_directory);
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit(args) => {
            let req = build_request(args)?;
            let url = format!("{base_url}/api/v1/jobs");
            let resp = client.post(&url).json(&req).send().await?;
            let job: JobInfo = read_json(resp, "creando el job").await?;
            println!("Job creado:");
            print_job(&job);
        }

        Commands::Status { id } => {
            let resp = client
                .get(format!("{base_url}/api/v1/jobs/{id}"))
                .send()
                .await?;
            let job: JobInfo = read_json(resp, "consultando el job").await?;
            print_job(&job);
        }

        Commands::List => {
            let resp = client.get(format!("{base_url}/api/v1/jobs")).send().await?;
            let jobs: Vec<JobInfo> = read_json(resp, "listando jobs").await?;
            if jobs.is_empty() {
                println!("No hay jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {:>5.1}%  {}",
                    job.id, job.state, job.progress_percent, job.name
                );
            }
        }

        Commands::Cancel { id } => {
            let resp = client
                .post(format!("{base_url}/api/v1/jobs/{id}/cancel"))
                .send()
                .await?;
            let answer: CancelResponse = read_json(resp, "cancelando el job").await?;
            if answer.accepted {
                println!("Cancelación pedida para el job {}", answer.job_id);
            } else {
                println!("El job {} no está en curso", answer.job_id);
            }
        }

        Commands::Delete { id } => {
            let resp = client
                .delete(format!("{base_url}/api/v1/jobs/{id}"))
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                bail!("borrando el job: el master respondió {status}");
            }
            println!("Job {id} borrado");
        }

        Commands::Logs { id, lines } => {
            let mut url = format!("{base_url}/api/v1/jobs/{id}/logs");
            if let Some(n) = lines {
                url.push_str(&format!("?lines={n}"));
            }
            let resp = client.get(url).send().await?;
            let logs: JobLogsResponse = read_json(resp, "leyendo el log").await?;
            if !logs.persisted {
                println!("(job en curso, log parcial)");
            }
            for line in logs.lines {
                println!("{line}");
            }
        }

        Commands::Results { id } => {
            let resp = client
                .get(format!("{base_url}/api/v1/jobs/{id}/results"))
                .send()
                .await?;
            let results: JobResults = read_json(resp, "consultando resultados").await?;
            println!("Resultados para job {} ({}):", results.job_id, results.state);
            println!("  directorio de salida: {}", results.output_dir);
            if results.files.is_empty() {
                println!("  (sin archivos de salida)");
            } else {
                for f in results.files {
                    println!("    - {} ({} bytes)", f.name, f.size_bytes);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(args: &[&str]) -> SubmitArgs {
        let mut argv = vec!["client", "submit"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Submit(args) => args,
            _ => panic!("se esperaba submit"),
        }
    }

    #[test]
    fn parametros_se_leen_como_json_si_se_puede() {
        assert_eq!(parse_param("threads=4").unwrap(), ("threads".into(), Value::from(4)));
        assert_eq!(
            parse_param("mode=fast").unwrap(),
            ("mode".into(), Value::String("fast".into()))
        );
        assert!(parse_param("sin_igual").is_err());
        assert!(parse_param("=3").is_err());
    }

    #[test]
    fn delete_recibe_el_id() {
        match Cli::try_parse_from(["client", "delete", "job-7"]).unwrap().command {
            Commands::Delete { id } => assert_eq!(id, "job-7"),
            _ => panic!("se esperaba delete"),
        }
    }

    #[test]
    fn submit_local_por_defecto() {
        let req = build_request(submit(&["dep44", "--dataset", "44"])).unwrap();
        assert_eq!(req.name, "dep44");
        assert_eq!(req.configuration_id, 1);
        assert!(!req.compute_on_cluster);
        assert!(req.cluster.is_none());
    }

    #[test]
    fn submit_con_conexion_propia_va_al_cluster() {
        let req = build_request(submit(&[
            "dep44",
            "--dataset",
            "44",
            "--host",
            "hpc.example.org",
            "--user",
            "noise",
            "--host-key-type",
            "ssh-ed25519",
            "--host-key",
            "AAAAC3Nz",
            "--param",
            "maxSrcDist=750",
        ]))
        .unwrap();
        assert!(req.compute_on_cluster);
        let cluster = req.cluster.unwrap();
        assert_eq!(cluster.host, "hpc.example.org");
        assert_eq!(cluster.port, 22);
        assert_eq!(cluster.host_key.as_deref(), Some("AAAAC3Nz"));
        assert_eq!(req.params["maxSrcDist"], Value::from(750));
    }
}
