//! End-to-end test driving the wire codec and session engine together over
//! an in-memory duplex stream: greeting, anonymous auth, repository open,
//! and a single `get-latest-rev` command, exactly as a real `svn://` client
//! would see them.

use std::collections::BTreeMap;
use std::sync::Arc;

use svnbridge_core::acl::{AclOracle, PathPrefixAclOracle};
use svnbridge_core::config::{AppConfig, AuthConfig, AuthMode, DaemonConfig, IdentityConfig, RepositoryConfig};
use svnbridge_core::git::GitStore;
use svnbridge_core::identity::IdentityMapper;
use svnbridge_core::repo::RepositoryRegistry;
use svnbridge_core::session::auth::Authenticator;
use svnbridge_core::session::Session;
use svnbridge_core::wire::{Token, WireReader, WireWriter};

fn init_bare_repo(dir: &std::path::Path) {
    git2::Repository::init(dir).unwrap();
    let git = GitStore::open(dir).unwrap();
    let blob = git.write_blob(b"hello world\n").unwrap();
    let mut files = BTreeMap::new();
    files.insert("trunk/readme.txt".to_string(), (blob, false));
    let tree = git.write_tree(&files).unwrap();
    let commit = git
        .write_commit(&tree, None, "Alice", "alice@example.com", "initial import")
        .unwrap();
    git.compare_and_swap_ref("refs/heads/master", None, &commit)
        .unwrap();
}

fn test_config(repo_dir: &std::path::Path, data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        daemon: DaemonConfig {
            listen: "127.0.0.1:0".to_string(),
            log_level: "info".to_string(),
            data_dir: data_dir.to_path_buf(),
            idle_timeout_secs: 5,
            editor_timeout_secs: 60,
            max_rebase_retries: 3,
        },
        repositories: vec![RepositoryConfig {
            name: "demo".to_string(),
            git_path: repo_dir.to_path_buf(),
            tracked_ref: "refs/heads/master".to_string(),
            uuid: None,
            properties_override_file: None,
        }],
        auth: AuthConfig {
            mode: AuthMode::Anonymous,
            allow_anonymous_read: true,
            password_file: None,
            ldap_url: None,
            ldap_base_dn: None,
            ldap_bind_dn: None,
            ldap_bind_password_env: None,
            ldap_bind_password: None,
        },
        identity: IdentityConfig::default(),
        resolved_secrets: std::collections::HashMap::new(),
    }
}

/// Write a minimal opening client greeting: `( version ( caps ) url ( ) )`.
/// The session engine discards this token entirely (the real handshake
/// data it cares about arrives later), so its shape only needs to parse.
async fn send_client_greeting(writer: &mut WireWriter<impl tokio::io::AsyncWrite + Unpin>, url: &str) {
    writer.list_begin().await.unwrap();
    writer.number(2).await.unwrap();
    writer.list_begin().await.unwrap();
    writer.list_end().await.unwrap();
    writer.string(url.as_bytes()).await.unwrap();
    writer.list_begin().await.unwrap();
    writer.list_end().await.unwrap();
    writer.list_end().await.unwrap();
    writer.flush().await.unwrap();
}

/// The second client message: `( url:string ( ) )`, which
/// `Session::open_repository` reads to resolve the target repository name
/// and root path.
async fn send_open_repo_request(writer: &mut WireWriter<impl tokio::io::AsyncWrite + Unpin>, url: &str) {
    writer.list_begin().await.unwrap();
    writer.string(url.as_bytes()).await.unwrap();
    writer.list_begin().await.unwrap();
    writer.list_end().await.unwrap();
    writer.list_end().await.unwrap();
    writer.flush().await.unwrap();
}

async fn send_command(
    writer: &mut WireWriter<impl tokio::io::AsyncWrite + Unpin>,
    name: &str,
    params: &[Token],
) {
    writer.list_begin().await.unwrap();
    writer.word(name).await.unwrap();
    writer.list_begin().await.unwrap();
    for p in params {
        write_token(writer, p).await;
    }
    writer.list_end().await.unwrap();
    writer.list_end().await.unwrap();
    writer.flush().await.unwrap();
}

fn write_token<'a, W: tokio::io::AsyncWrite + Unpin>(
    writer: &'a mut WireWriter<W>,
    token: &'a Token,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        match token {
            Token::Number(n) => writer.number(*n).await.unwrap(),
            Token::Word(w) => writer.word(w).await.unwrap(),
            Token::String(s) => writer.string(s).await.unwrap(),
            Token::List(items) => {
                writer.list_begin().await.unwrap();
                for item in items {
                    write_token(writer, item).await;
                }
                writer.list_end().await.unwrap();
            }
        }
    })
}

#[tokio::test]
async fn anonymous_session_greets_authenticates_and_answers_get_latest_rev() {
    let repo_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    init_bare_repo(repo_dir.path());

    let config = test_config(repo_dir.path(), data_dir.path());
    let registry = Arc::new(RepositoryRegistry::open_all(&config).unwrap());
    let identity = Arc::new(IdentityMapper::new(&config.identity).unwrap());
    let authenticator = Arc::new(Authenticator::new(&config.auth).unwrap());
    let acl: Arc<dyn AclOracle> = Arc::new(PathPrefixAclOracle::open_read());

    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let session = Session::new(
        server_read,
        server_write,
        registry,
        identity,
        acl,
        authenticator,
        &config.daemon,
    );
    let server_task = tokio::spawn(session.run());

    let mut client_reader = WireReader::new(client_read);
    let mut client_writer = WireWriter::new(client_write);

    // Greeting: server announces version range, capabilities, and an empty
    // announcement string; the client answers with its own hello.
    let greeting = client_reader.read_token().await.unwrap();
    let greeting_items = greeting.as_list().expect("greeting is a list");
    assert_eq!(greeting_items[0].as_number(), Some(2));
    assert_eq!(greeting_items[1].as_number(), Some(2));
    send_client_greeting(&mut client_writer, "svn://127.0.0.1/demo").await;

    // Auth: anonymous mode offers only ANONYMOUS.
    let auth_offer = client_reader.read_token().await.unwrap();
    let offer_items = auth_offer.as_list().unwrap();
    assert_eq!(offer_items[0].as_word(), Some("success"));
    let mechs = offer_items[1].as_list().unwrap()[0].as_list().unwrap();
    assert_eq!(mechs[0].as_word(), Some("ANONYMOUS"));

    send_command(&mut client_writer, "ANONYMOUS", &[]).await;

    let auth_result = client_reader.read_token().await.unwrap();
    let auth_items = auth_result.as_list().unwrap();
    assert_eq!(auth_items[0].as_word(), Some("success"));

    // Repository open.
    send_open_repo_request(&mut client_writer, "svn://127.0.0.1/demo").await;
    let open_result = client_reader.read_token().await.unwrap();
    let open_items = open_result.as_list().unwrap();
    assert_eq!(open_items[0].as_word(), Some("success"));
    let body = open_items[1].as_list().unwrap();
    let uuid = String::from_utf8(body[0].as_string().unwrap().to_vec()).unwrap();
    assert!(!uuid.is_empty());

    // Command loop: get-latest-rev should report revision 1 (one commit
    // was made in `init_bare_repo`).
    send_command(&mut client_writer, "get-latest-rev", &[]).await;
    let response = client_reader.read_token().await.unwrap();
    let items = response.as_list().unwrap();
    assert_eq!(items[0].as_word(), Some("success"));
    let rev = items[1].as_list().unwrap()[0].as_number().unwrap();
    assert_eq!(rev, 1);

    // Clean disconnect.
    send_command(&mut client_writer, "EOF", &[]).await;
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn commit_drive_adds_a_file_and_advances_the_revision() {
    let repo_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    init_bare_repo(repo_dir.path());

    let config = test_config(repo_dir.path(), data_dir.path());
    let registry = Arc::new(RepositoryRegistry::open_all(&config).unwrap());
    let identity = Arc::new(IdentityMapper::new(&config.identity).unwrap());
    let authenticator = Arc::new(Authenticator::new(&config.auth).unwrap());
    // Anonymous write is denied by `open_read()`'s default policy; grant it
    // explicitly here via a root-prefix rule so the commit below is allowed.
    let acl: Arc<dyn AclOracle> = Arc::new(svnbridge_core::acl::PathPrefixAclOracle::new(vec![
        svnbridge_core::acl::AclRule {
            path_prefix: "/".to_string(),
            principal: "*".to_string(),
            allow_read: true,
            allow_write: true,
            allow_admin: true,
        },
    ]));

    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let session = Session::new(
        server_read,
        server_write,
        registry,
        identity,
        acl,
        authenticator,
        &config.daemon,
    );
    let server_task = tokio::spawn(session.run());

    let mut client_reader = WireReader::new(client_read);
    let mut client_writer = WireWriter::new(client_write);

    client_reader.read_token().await.unwrap(); // greeting
    send_client_greeting(&mut client_writer, "svn://127.0.0.1/demo").await;
    client_reader.read_token().await.unwrap(); // auth offer
    send_command(&mut client_writer, "ANONYMOUS", &[]).await;
    client_reader.read_token().await.unwrap(); // auth result
    send_open_repo_request(&mut client_writer, "svn://127.0.0.1/demo").await;
    client_reader.read_token().await.unwrap(); // open-repository result

    send_command(
        &mut client_writer,
        "commit",
        &[
            Token::String(b"adding a new file".to_vec()),
            Token::List(vec![]),
            Token::Word("false".to_string()),
            Token::List(vec![]),
        ],
    )
    .await;
    let intermediate = client_reader.read_token().await.unwrap();
    assert_eq!(intermediate.as_list().unwrap()[0].as_word(), Some("success"));

    send_command(
        &mut client_writer,
        "open-root",
        &[Token::List(vec![]), Token::Word("r0".to_string())],
    )
    .await;
    send_command(
        &mut client_writer,
        "add-file",
        &[
            Token::String(b"new.txt".to_vec()),
            Token::Word("r0".to_string()),
            Token::Word("c1".to_string()),
            Token::List(vec![]),
        ],
    )
    .await;
    send_command(
        &mut client_writer,
        "apply-textdelta",
        &[Token::Word("c1".to_string()), Token::List(vec![])],
    )
    .await;
    let delta = svnbridge_core::delta::encode(&[], b"brand new content\n");
    send_command(
        &mut client_writer,
        "textdelta-chunk",
        &[Token::Word("c1".to_string()), Token::String(delta)],
    )
    .await;
    send_command(&mut client_writer, "textdelta-end", &[Token::Word("c1".to_string())]).await;
    send_command(&mut client_writer, "close-file", &[Token::Word("c1".to_string()), Token::List(vec![])]).await;
    send_command(&mut client_writer, "close-dir", &[Token::Word("r0".to_string())]).await;
    send_command(&mut client_writer, "close-edit", &[]).await;

    let commit_result = client_reader.read_token().await.unwrap();
    let items = commit_result.as_list().unwrap();
    assert_eq!(items[0].as_word(), Some("success"));
    let new_rev = items[1].as_list().unwrap()[0].as_number().unwrap();
    assert_eq!(new_rev, 2);

    send_command(&mut client_writer, "get-latest-rev", &[]).await;
    let response = client_reader.read_token().await.unwrap();
    let rev = response.as_list().unwrap()[1].as_list().unwrap()[0].as_number().unwrap();
    assert_eq!(rev, 2);

    send_command(&mut client_writer, "EOF", &[]).await;
    server_task.await.unwrap().unwrap();
}
