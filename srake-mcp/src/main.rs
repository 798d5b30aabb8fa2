//! srake MCP server - line-delimited JSON-RPC over stdio exposing search
//! and lookup tools.

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srake_core::export::ExportFormat;
use srake_core::search::{LazyIndex, SearchMode, SearchOptions, SearchRouter};
use srake_core::{Config, MetadataStore};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "srake-mcp")]
#[command(about = "MCP server for SRA metadata search")]
struct Args {
    /// Path to the metadata store (env: SRAKE_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());

    let server = match McpServer::new(args.db) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("srake-mcp: {err}");
            std::process::exit(2);
        }
    };

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        if line.is_empty() {
            continue;
        }

        let response = server.handle_request(&line);
        if let Some(resp) = response {
            let _ = writeln!(stdout, "{}", resp);
            let _ = stdout.flush();
        }
    }
}

struct McpServer {
    db_path: PathBuf,
    router: SearchRouter,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl McpServer {
    fn new(db: Option<PathBuf>) -> srake_core::Result<Self> {
        let config = Config::load_default()?;
        let db_path = srake_core::paths::db_path(db.as_deref());

        let index = Arc::new(LazyIndex::new(
            &srake_core::paths::index_path(&db_path),
            config.idle_timeout(),
        ));
        let embedder = if config.vector_enabled() {
            Some(Arc::new(srake_core::embed::HttpEmbedder::new(&config.embedding)?)
                as Arc<dyn srake_core::embed::Embedder>)
        } else {
            None
        };
        let router = SearchRouter::new(
            index,
            &srake_core::paths::embeddings_path(&db_path),
            embedder,
            config.search.default_limit,
            config.search.hybrid_weight,
        )
        .with_timeout(config.search_timeout());

        Ok(Self { db_path, router })
    }

    fn store(&self) -> srake_core::Result<MetadataStore> {
        MetadataStore::open_read(&self.db_path)
    }

    fn handle_request(&self, line: &str) -> Option<String> {
        let req: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return Some(
                    json!({
                        "jsonrpc": "2.0",
                        "id": null,
                        "error": { "code": -32700, "message": format!("Parse error: {}", e) }
                    })
                    .to_string(),
                );
            }
        };

        let id = req.id.clone().unwrap_or(Value::Null);

        let result = match req.method.as_str() {
            "initialize" => self.handle_initialize(),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(&req.params),
            "notifications/initialized" => return None, // No response for notifications
            _ => Err((-32601, format!("Method not found: {}", req.method))),
        };

        let response = match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: Some(value),
                error: None,
            },
            Err((code, message)) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(JsonRpcError { code, message }),
            },
        };

        Some(serde_json::to_string(&response).unwrap_or_default())
    }

    fn handle_initialize(&self) -> Result<Value, (i32, String)> {
        Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": "srake-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        }))
    }

    fn handle_tools_list(&self) -> Result<Value, (i32, String)> {
        Ok(json!({
            "tools": [
                {
                    "name": "search_sra",
                    "description": "Search SRA metadata across the keyword, accession, and vector tiers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "query": {
                                "type": "string",
                                "description": "Free text, technical keywords, or an accession"
                            },
                            "limit": { "type": "integer", "description": "Maximum results (default 20)" },
                            "mode": {
                                "type": "string",
                                "enum": ["auto", "keyword", "fts", "vector", "hybrid"],
                                "description": "Search mode (default auto)"
                            },
                            "organism": { "type": "string", "description": "Filter by scientific name" },
                            "platform": { "type": "string", "description": "Filter by sequencing platform" },
                            "similarity_threshold": {
                                "type": "number",
                                "description": "Drop hits below this cosine similarity"
                            }
                        },
                        "required": ["query"]
                    }
                },
                {
                    "name": "get_metadata",
                    "description": "Fetch one SRA entity (study, experiment, sample, or run) by accession",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "accession": {
                                "type": "string",
                                "description": "Accession such as SRP000001 or SRR12345678"
                            }
                        },
                        "required": ["accession"]
                    }
                },
                {
                    "name": "find_similar",
                    "description": "Find studies similar to a given study accession",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "accession": { "type": "string", "description": "Study accession (SRP/ERP/DRP)" },
                            "limit": { "type": "integer", "description": "Maximum results (default 10)" }
                        },
                        "required": ["accession"]
                    }
                },
                {
                    "name": "export_results",
                    "description": "Run a search and export the matching entities as json, csv, or tsv",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "Search query" },
                            "format": {
                                "type": "string",
                                "enum": ["json", "csv", "tsv"],
                                "description": "Export format (default json)"
                            },
                            "limit": { "type": "integer", "description": "Maximum rows (default 100)" }
                        },
                        "required": ["query"]
                    }
                }
            ]
        }))
    }

    fn handle_tools_call(&self, params: &Option<Value>) -> Result<Value, (i32, String)> {
        let params = params
            .as_ref()
            .ok_or((-32602, "Missing params".to_string()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((-32602, "Missing tool name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let outcome = match name {
            "search_sra" => self.tool_search(&arguments),
            "get_metadata" => self.tool_get_metadata(&arguments),
            "find_similar" => self.tool_find_similar(&arguments),
            "export_results" => self.tool_export(&arguments),
            other => return Err((-32602, format!("Unknown tool: {other}"))),
        };

        match outcome {
            Ok(value) => Ok(json!({
                "content": [{ "type": "text", "text": value }]
            })),
            Err(err) => Err((-32000, err.to_string())),
        }
    }

    fn tool_search(&self, args: &Value) -> srake_core::Result<String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mode: SearchMode = args
            .get("mode")
            .cloned()
            .and_then(|m| serde_json::from_value(m).ok())
            .unwrap_or_default();

        let options = SearchOptions {
            limit: args.get("limit").and_then(Value::as_u64).map(|l| l as usize),
            mode,
            filters: srake_core::search::SearchFilters {
                organism: args
                    .get("organism")
                    .and_then(Value::as_str)
                    .map(String::from),
                platform: args
                    .get("platform")
                    .and_then(Value::as_str)
                    .map(String::from),
                library_strategy: None,
            },
            similarity_threshold: args
                .get("similarity_threshold")
                .and_then(Value::as_f64)
                .map(|v| v as f32),
            ..Default::default()
        };

        let store = self.store()?;
        let result = self.router.search(&store, query, &options)?;
        Ok(serde_json::to_string_pretty(&result)?)
    }

    fn tool_get_metadata(&self, args: &Value) -> srake_core::Result<String> {
        let accession = args
            .get("accession")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let store = self.store()?;
        match srake_core::lookup::get(&store, accession)? {
            Some(entity) => Ok(serde_json::to_string_pretty(&entity)?),
            None => Err(srake_core::SrakeError::NotFound(accession.to_string())),
        }
    }

    /// Similar studies: vector neighbors when embeddings exist, otherwise
    /// a keyword search seeded with the study title.
    fn tool_find_similar(&self, args: &Value) -> srake_core::Result<String> {
        let accession = args
            .get("accession")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;

        let store = self.store()?;
        let entity = srake_core::lookup::get(&store, accession)?
            .ok_or_else(|| srake_core::SrakeError::NotFound(accession.to_string()))?;

        let seed = match &entity {
            srake_core::store::EntityRow::Study(study) => {
                let mut seed = study.title.clone().unwrap_or_default();
                if let Some(abstract_text) = &study.abstract_text {
                    seed.push(' ');
                    seed.push_str(abstract_text);
                }
                seed
            }
            _ => {
                return Err(srake_core::SrakeError::InvalidAccession(format!(
                    "{accession} is not a study accession"
                )))
            }
        };

        let options = SearchOptions {
            limit: Some(limit + 1),
            mode: SearchMode::Hybrid,
            ..Default::default()
        };
        let mut result = self.router.search(&store, &seed, &options)?;
        // the seed study matches itself; drop it
        result.hits.retain(|h| h.id != accession);
        result.hits.truncate(limit);
        Ok(serde_json::to_string_pretty(&result)?)
    }

    fn tool_export(&self, args: &Value) -> srake_core::Result<String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let format = ExportFormat::parse(
            args.get("format").and_then(Value::as_str).unwrap_or("json"),
        )?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(100) as usize;

        let store = self.store()?;
        let options = SearchOptions {
            limit: Some(limit),
            ..Default::default()
        };
        let result = self.router.search(&store, query, &options)?;
        let accessions: Vec<String> = result.hits.into_iter().map(|h| h.id).collect();

        let mut out = Vec::new();
        srake_core::export::export_accessions(&store, &accessions, format, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srake_core::record::{SraRecord, Study};
    use srake_core::store::insert_record;
    use tempfile::TempDir;

    fn server_with_store(dir: &TempDir) -> McpServer {
        let db_path = dir.path().join("srake.db");
        let mut store = MetadataStore::open(&db_path).unwrap();
        store
            .tx(|tx| {
                insert_record(
                    tx,
                    &SraRecord::Study(Study {
                        accession: "SRP000001".into(),
                        title: Some("liver study".into()),
                        ..Default::default()
                    }),
                )
            })
            .unwrap();
        srake_core::store::fts::rebuild(store.connection()).unwrap();
        McpServer::new(Some(db_path)).unwrap()
    }

    #[test]
    fn test_tools_list_has_all_tools() {
        let dir = TempDir::new().unwrap();
        let server = server_with_store(&dir);
        let tools = server.handle_tools_list().unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["search_sra", "get_metadata", "find_similar", "export_results"]
        );
    }

    #[test]
    fn test_get_metadata_round_trip() {
        let dir = TempDir::new().unwrap();
        let server = server_with_store(&dir);
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "get_metadata",
                "arguments": { "accession": "SRP000001" }
            }
        });
        let response = server.handle_request(&request.to_string()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        let text = parsed["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("SRP000001"));
        assert!(text.contains("liver study"));
    }

    #[test]
    fn test_unknown_method_is_rpc_error() {
        let dir = TempDir::new().unwrap();
        let server = server_with_store(&dir);
        let request = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "bogus/method"
        });
        let response = server.handle_request(&request.to_string()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["error"]["code"], -32601);
    }

    #[test]
    fn test_accession_search_uses_fts_tier() {
        let dir = TempDir::new().unwrap();
        let server = server_with_store(&dir);
        let request = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "search_sra",
                "arguments": { "query": "SRP000001" }
            }
        });
        let response = server.handle_request(&request.to_string()).unwrap();
        let parsed: Value = serde_json::from_str(&response).unwrap();
        let text = parsed["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"mode\": \"fts\""));
        assert!(text.contains("SRP000001"));
    }
}
