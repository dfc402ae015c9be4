//! Unit tests for bootstrap command rendering.

use super::*;
use rstest::{fixture, rstest};

#[fixture]
fn params() -> ConnectionParams {
    ConnectionParams {
        master_url: String::from("pnp://master:64738"),
        credentials: String::from("cred blob"),
        node_source: String::from("node_source_name"),
        node_bundle_url: String::from("https://master/rest/node.jar"),
        additional_properties: String::from("-Dproactive.useIPaddress=true"),
    }
}

fn instance(id: &str, os_family: OsFamily) -> Instance {
    Instance::new(id, "node_source_name", os_family)
}

fn templates() -> ScriptTemplates {
    ScriptTemplates::new(
        "java -jar node.jar -r ${MASTER_URL} -n ${NODE_NAME} -s ${NODE_SOURCE} -v ${CREDENTIALS}",
        "java -jar node.jar -r ${MASTER_URL} -n ${NODE_NAME} -v ${CREDENTIALS}",
    )
}

#[rstest]
fn linux_command_quotes_values_for_posix_shell(params: ConnectionParams) {
    let command = build_command(&instance("i1", OsFamily::Linux), &templates(), 2, &params)
        .expect("command should render");

    assert_eq!(command.node_name, "node_source_name_i1_2");
    assert_eq!(command.node_index, 2);
    let master = escape(Cow::Borrowed("pnp://master:64738"));
    assert_eq!(
        command.command,
        format!(
            "java -jar node.jar -r {master} -n node_source_name_i1_2 \
             -s node_source_name -v 'cred blob'"
        )
    );
    assert_eq!(
        command.extra_args,
        vec![String::from("node_source_name_i1_2"), String::from("2")]
    );
}

#[rstest]
fn windows_command_uses_powershell_quoting(mut params: ConnectionParams) {
    params.credentials = String::from("it's secret");

    let command = build_command(&instance("i9", OsFamily::Windows), &templates(), 1, &params)
        .expect("command should render");

    assert_eq!(
        command.command,
        "java -jar node.jar -r 'pnp://master:64738' -n 'node_source_name_i9_1' -v 'it''s secret'"
    );
}

#[rstest]
fn missing_template_for_os_is_reported(params: ConnectionParams) {
    let only_linux = ScriptTemplates::new("echo ${NODE_NAME}", "  ");

    let err = build_command(&instance("i1", OsFamily::Windows), &only_linux, 1, &params)
        .expect_err("blank windows template should fail");

    assert_eq!(
        err,
        ScriptError::MissingTemplate {
            os_family: OsFamily::Windows
        }
    );
}

#[rstest]
fn zero_node_index_is_rejected(params: ConnectionParams) {
    let err = build_command(&instance("i1", OsFamily::Linux), &templates(), 0, &params)
        .expect_err("index 0 should fail");
    assert_eq!(err, ScriptError::InvalidNodeIndex);
}

#[rstest]
fn unknown_and_unterminated_placeholders_are_left_alone(params: ConnectionParams) {
    let odd = ScriptTemplates::new("run ${UNKNOWN} ${NODE_INDEX} ${TRAILING", "");

    let command = build_command(&instance("i1", OsFamily::Linux), &odd, 3, &params)
        .expect("command should render");

    assert_eq!(command.command, "run ${UNKNOWN} 3 ${TRAILING");
}

fn nested_windows() -> ScriptTemplates {
    ScriptTemplates::new("", "props=${ADDITIONAL_PROPERTIES}")
}

#[rstest]
fn substituted_values_are_not_rescanned(mut params: ConnectionParams) {
    params.additional_properties = String::from("${MASTER_URL}");

    let command = build_command(&instance("i1", OsFamily::Windows), &nested_windows(), 1, &params)
        .expect("command should render");

    assert_eq!(command.command, "props='${MASTER_URL}'");
}

#[rstest]
fn rendering_is_deterministic(params: ConnectionParams) {
    let target = instance("i1", OsFamily::Linux);
    let first = build_command(&target, &templates(), 1, &params).expect("first render");
    let second = build_command(&target, &templates(), 1, &params).expect("second render");
    assert_eq!(first, second);
}

#[rstest]
#[case("pool_i1_1", "i1", Some(1))]
#[case("pool_i1_12", "i1", Some(12))]
#[case("my_pool_i_1_3", "i_1", Some(3))]
#[case("pool_i1_0", "i1", None)]
#[case("pool_i2_1", "i1", None)]
#[case("pool_i1_x", "i1", None)]
#[case("i1_1", "i1", None)]
fn recovers_node_index_from_name(
    #[case] name: &str,
    #[case] instance_id: &str,
    #[case] expected: Option<u32>,
) {
    assert_eq!(node_index_from_name(name, instance_id), expected);
}

#[rstest]
fn debug_output_hides_rendered_command(params: ConnectionParams) {
    let command = build_command(&instance("i1", OsFamily::Linux), &templates(), 1, &params)
        .expect("command should render");
    let rendered = format!("{command:?}");
    assert!(!rendered.contains("cred blob"), "credentials leaked: {rendered}");
    let params_debug = format!("{params:?}");
    assert!(!params_debug.contains("cred blob"));
}
